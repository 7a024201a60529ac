//! Health gate: decides which replicas count as serving capacity.
//!
//! Each replica carries a `HealthTracker` that turns raw probe results
//! into a status with hysteresis: a replica is admitted after
//! `healthy_threshold` consecutive passes and demoted after
//! `unhealthy_threshold` consecutive failures.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use http::header::{HOST, USER_AGENT};
use http::uri::{InvalidUri, PathAndQuery};
use tracing::debug;

use tilescale_core::HealthStatus;

use crate::orchestrator::Replica;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn probe(&self, replica: &Replica) -> ProbeResult;

    async fn is_healthy(&self, replica: &Replica) -> bool {
        self.probe(replica).await == ProbeResult::Healthy
    }
}

/// Tracks consecutive probe results for a single replica.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.healthy_threshold {
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unhealthy_threshold {
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Admitted replicas count toward the pool's current count.
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn needs_replacement(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Health gate that issues `GET <path>` against each replica's address.
///
/// One connection per probe: replicas come and go, so nothing is pooled.
pub struct HttpHealthGate {
    path: PathAndQuery,
    timeout: Duration,
}

/// Why a probe produced no status code.
#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl HttpHealthGate {
    /// `path` is the request target, e.g. `/services`.
    pub fn new(path: &str, timeout: Duration) -> Result<Self, InvalidUri> {
        Ok(Self {
            path: path.parse()?,
            timeout,
        })
    }

    async fn status_of(&self, address: &str) -> Result<StatusCode, ProbeError> {
        let stream = tokio::net::TcpStream::connect(address).await?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream)).await?;
        let driver = tokio::spawn(conn);

        let req = http::Request::get(self.path.clone())
            .header(HOST, address)
            .header(USER_AGENT, "tilescale-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())?;
        let status = sender.send_request(req).await.map(|resp| resp.status());

        driver.abort();
        Ok(status?)
    }
}

#[async_trait]
impl HealthGate for HttpHealthGate {
    async fn probe(&self, replica: &Replica) -> ProbeResult {
        let outcome = tokio::time::timeout(self.timeout, self.status_of(&replica.address))
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.timeout)));

        match outcome {
            Ok(status) if status.is_success() => ProbeResult::Healthy,
            Ok(status) => {
                debug!(id = %replica.id, path = %self.path, %status, "health check returned non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(id = %replica.id, address = %replica.address, error = %e, "health check failed");
                ProbeResult::Failed
            }
        }
    }
}
