//! Request aggregator: turns raw request counts into metric samples.
//!
//! The load balancer reports how many requests it forwarded; once per
//! sampling interval the aggregator divides the window's total by the
//! number of ready replicas and emits the result as a `MetricSample`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tilescale_core::{MetricSample, epoch_secs};

pub struct RequestAggregator {
    /// Requests recorded since the last sample.
    window: AtomicU64,
    /// Requests recorded since start.
    total: AtomicU64,
    interval: Duration,
}

impl RequestAggregator {
    pub fn new(interval: Duration) -> Self {
        Self {
            window: AtomicU64::new(0),
            total: AtomicU64::new(0),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Add `count` requests to the current window.
    pub fn record(&self, count: u64) {
        self.window.fetch_add(count, Ordering::Relaxed);
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    /// Requests in the current, still-open window.
    pub fn pending(&self) -> u64 {
        self.window.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Close the current window and return it as a per-replica sample.
    ///
    /// With no ready replicas the whole window is attributed to one
    /// replica; the controller's proportional formula yields the minimum
    /// count in that case regardless.
    pub fn take_sample(&self, ready: u32, timestamp: u64) -> MetricSample {
        let count = self.window.swap(0, Ordering::Relaxed);
        let per_replica = count as f64 / ready.max(1) as f64;
        MetricSample::new(per_replica, timestamp)
    }

    /// Emit one sample per interval until shutdown or the receiver closes.
    pub async fn run<F>(
        &self,
        ready: F,
        samples: mpsc::Sender<MetricSample>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn() -> u32 + Send,
    {
        info!(interval_secs = self.interval.as_secs(), "request aggregator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let ready_now = ready();
                    let sample = self.take_sample(ready_now, epoch_secs());
                    debug!(
                        ready = ready_now,
                        requests_per_replica = sample.requests_per_replica,
                        "emitting metric sample"
                    );
                    if samples.send(sample).await.is_err() {
                        warn!("sample receiver closed, request aggregator stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("request aggregator shutting down");
                    break;
                }
            }
        }
    }
}
