//! The single-owner control loop.
//!
//! One task owns both the `Autoscaler` and the `ReplicaPool`. Metric
//! samples and health polls are serialized through one `select!`, so an
//! evaluation always runs to completion before the next input is read.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tilescale_core::MetricSample;
use tilescale_pool::{ReplicaPool, ReplicaView};

use crate::error::AutoscaleResult;
use crate::scaler::{Autoscaler, ControllerState, ScaleDecision};

/// Snapshot of controller and pool state, published after every input.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStatus {
    pub target_requests_per_replica: f64,
    pub scale_out_cooldown_secs: u64,
    pub scale_in_cooldown_secs: u64,
    pub min_count: u32,
    pub max_count: u32,
    /// Replicas admitted by the health gate.
    pub current_count: u32,
    pub desired_count: u32,
    pub total_count: u32,
    pub state: ControllerState,
    pub last_sample: Option<MetricSample>,
    pub last_decision: Option<ScaleDecision>,
    pub samples_evaluated: u64,
    pub dropped_samples: u64,
    pub failed_applies: u64,
    pub replicas: Vec<ReplicaView>,
}

pub struct ControlLoop {
    autoscaler: Autoscaler,
    pool: ReplicaPool,
    health_interval: Duration,
    status_tx: watch::Sender<ControllerStatus>,
    last_sample: Option<MetricSample>,
    last_decision: Option<ScaleDecision>,
    samples_evaluated: u64,
    failed_applies: u64,
}

impl ControlLoop {
    /// Create the loop and a receiver that always holds the latest status.
    pub fn new(
        autoscaler: Autoscaler,
        pool: ReplicaPool,
        health_interval: Duration,
    ) -> (Self, watch::Receiver<ControllerStatus>) {
        let (status_tx, status_rx) = watch::channel(ControllerStatus::default());
        let control = Self {
            autoscaler,
            pool,
            health_interval,
            status_tx,
            last_sample: None,
            last_decision: None,
            samples_evaluated: 0,
            failed_applies: 0,
        };
        control.publish();
        (control, status_rx)
    }

    pub fn pool(&self) -> &ReplicaPool {
        &self.pool
    }

    pub fn autoscaler(&self) -> &Autoscaler {
        &self.autoscaler
    }

    /// Bring the pool up to the policy minimum.
    pub async fn start(&mut self) {
        let min = self.autoscaler.policy().min_count();
        if let Err(e) = self.pool.set_desired_count(min).await {
            warn!(min, error = %e, "initial scale to minimum failed; health polls will retry");
        }
        self.publish();
    }

    /// Evaluate one sample against the pool and apply the result.
    pub async fn handle_sample(&mut self, sample: MetricSample) -> AutoscaleResult<ScaleDecision> {
        let result = self.autoscaler.tick(&sample, &mut self.pool).await;
        match &result {
            Ok(decision) => {
                self.samples_evaluated += 1;
                self.last_sample = Some(sample);
                self.last_decision = Some(*decision);
            }
            Err(e) if e.is_retryable() => {
                self.samples_evaluated += 1;
                self.last_sample = Some(sample);
                self.failed_applies += 1;
            }
            Err(_) => {}
        }
        self.publish();
        result
    }

    /// Run one health poll.
    pub async fn handle_health_poll(&mut self) {
        match self.pool.poll_health().await {
            Ok(report) => debug!(
                ready = report.ready,
                pending = report.pending,
                admitted = report.admitted,
                replaced = report.replaced,
                "health poll complete"
            ),
            Err(e) => warn!(error = %e, "health poll could not reconcile pool"),
        }
        self.publish();
    }

    /// Run until shutdown or until every sample sender is dropped.
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<MetricSample>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            health_interval_secs = self.health_interval.as_secs(),
            min = self.autoscaler.policy().min_count(),
            max = self.autoscaler.policy().max_count(),
            "control loop started"
        );

        self.start().await;

        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_sample = samples.recv() => {
                    let Some(sample) = maybe_sample else {
                        info!("metric source closed");
                        break;
                    };
                    if let Err(e) = self.handle_sample(sample).await
                        && e.is_retryable()
                    {
                        error!(error = %e, "scale command not applied; will retry next sample");
                    }
                }
                _ = health.tick() => {
                    self.handle_health_poll().await;
                }
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }

    fn publish(&self) {
        let policy = self.autoscaler.policy();
        let status = ControllerStatus {
            target_requests_per_replica: policy.target_requests_per_replica(),
            scale_out_cooldown_secs: policy.scale_out_cooldown().as_secs(),
            scale_in_cooldown_secs: policy.scale_in_cooldown().as_secs(),
            min_count: policy.min_count(),
            max_count: policy.max_count(),
            current_count: self.pool.current_count(),
            desired_count: self.pool.desired_count(),
            total_count: self.pool.total_count(),
            state: self.autoscaler.state(),
            last_sample: self.last_sample,
            last_decision: self.last_decision,
            samples_evaluated: self.samples_evaluated,
            dropped_samples: self.autoscaler.dropped_samples(),
            failed_applies: self.failed_applies,
            replicas: self.pool.replicas(),
        };
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tilescale_core::ScalingPolicy;
    use tilescale_pool::testing::{FakeHealthGate, FakeOrchestrator};

    fn test_loop() -> (ControlLoop, watch::Receiver<ControllerStatus>, Arc<FakeOrchestrator>) {
        let orch = Arc::new(FakeOrchestrator::new());
        let gate = Arc::new(FakeHealthGate::new());
        let policy = ScalingPolicy::default();
        let pool = ReplicaPool::new(policy.min_count(), policy.max_count(), orch.clone(), gate);
        let (control, status) =
            ControlLoop::new(Autoscaler::new(policy), pool, Duration::from_millis(10));
        (control, status, orch)
    }

    #[tokio::test]
    async fn start_scales_to_minimum() {
        let (mut control, status, orch) = test_loop();
        control.start().await;
        assert_eq!(orch.launches(), 2);
        assert_eq!(status.borrow().desired_count, 2);
        assert_eq!(status.borrow().current_count, 0);

        control.handle_health_poll().await;
        assert_eq!(status.borrow().current_count, 2);
        assert_eq!(status.borrow().replicas.len(), 2);
    }

    #[tokio::test]
    async fn handle_sample_publishes_decision() {
        let (mut control, status, _orch) = test_loop();
        control.start().await;
        control.handle_health_poll().await;

        let decision = control
            .handle_sample(MetricSample::new(100.0, 1000))
            .await
            .unwrap();
        assert_eq!(decision.target(), Some(4));

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.desired_count, 4);
        assert_eq!(snapshot.samples_evaluated, 1);
        assert_eq!(snapshot.last_decision, Some(decision));
        assert_eq!(snapshot.state.last_scale_out_at, Some(1000));
    }

    #[tokio::test]
    async fn invalid_sample_is_counted_not_applied() {
        let (mut control, status, orch) = test_loop();
        control.start().await;

        assert!(control.handle_sample(MetricSample::new(-5.0, 1000)).await.is_err());
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.dropped_samples, 1);
        assert_eq!(snapshot.samples_evaluated, 0);
        assert!(snapshot.last_sample.is_none());
        assert_eq!(orch.launches(), 2);
    }

    #[tokio::test]
    async fn failed_apply_is_counted() {
        let (mut control, status, orch) = test_loop();
        control.start().await;
        control.handle_health_poll().await;

        orch.set_unreachable(true);
        assert!(control.handle_sample(MetricSample::new(100.0, 1000)).await.is_err());
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.failed_applies, 1);
        assert_eq!(snapshot.state.last_scale_out_at, None);
    }

    #[tokio::test]
    async fn run_processes_samples_until_shutdown() {
        let (control, mut status, _orch) = test_loop();
        let (sample_tx, sample_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(control.run(sample_rx, shutdown_rx));

        // Wait for the first health poll to admit the minimum replicas.
        status
            .wait_for(|s| s.current_count == 2)
            .await
            .unwrap();

        sample_tx.send(MetricSample::new(100.0, 1000)).await.unwrap();
        status
            .wait_for(|s| s.current_count == 4)
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_stops_when_source_closes() {
        let (control, _status, _orch) = test_loop();
        let (sample_tx, sample_rx) = mpsc::channel::<MetricSample>(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        drop(sample_tx);
        control.run(sample_rx, shutdown_rx).await;
    }
}
