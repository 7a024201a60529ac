//! Domain types shared by the controller, the pool, and the metric source.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Identifier assigned to a replica by the orchestration substrate.
pub type ReplicaId = String;

// ── Metric sample ─────────────────────────────────────────────────

/// One observation of load-balancer traffic, normalized per replica.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Requests per ready replica over the sampling interval.
    pub requests_per_replica: f64,
    /// Unix timestamp (seconds) when the sample was taken.
    pub timestamp: u64,
}

impl MetricSample {
    pub fn new(requests_per_replica: f64, timestamp: u64) -> Self {
        Self {
            requests_per_replica,
            timestamp,
        }
    }

    /// Sample stamped with the current wall-clock time.
    pub fn now(requests_per_replica: f64) -> Self {
        Self::new(requests_per_replica, epoch_secs())
    }

    /// A sample is usable only if the load figure is finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.requests_per_replica.is_finite() && self.requests_per_replica >= 0.0
    }
}

// ── Scaling policy ────────────────────────────────────────────────

/// Validated autoscaling parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    target_requests_per_replica: f64,
    scale_out_cooldown: Duration,
    scale_in_cooldown: Duration,
    min_count: u32,
    max_count: u32,
}

impl ScalingPolicy {
    /// Build a policy, rejecting bounds or targets the controller can't honor.
    pub fn new(
        target_requests_per_replica: f64,
        scale_out_cooldown: Duration,
        scale_in_cooldown: Duration,
        min_count: u32,
        max_count: u32,
    ) -> ConfigResult<Self> {
        if !target_requests_per_replica.is_finite() || target_requests_per_replica <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "target_requests_per_replica must be positive, got {target_requests_per_replica}"
            )));
        }
        if min_count == 0 {
            return Err(ConfigError::Invalid("min_count must be at least 1".to_string()));
        }
        if min_count > max_count {
            return Err(ConfigError::Invalid(format!(
                "min_count ({min_count}) exceeds max_count ({max_count})"
            )));
        }

        Ok(Self {
            target_requests_per_replica,
            scale_out_cooldown,
            scale_in_cooldown,
            min_count,
            max_count,
        })
    }

    pub fn target_requests_per_replica(&self) -> f64 {
        self.target_requests_per_replica
    }

    pub fn scale_out_cooldown(&self) -> Duration {
        self.scale_out_cooldown
    }

    pub fn scale_in_cooldown(&self) -> Duration {
        self.scale_in_cooldown
    }

    pub fn min_count(&self) -> u32 {
        self.min_count
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Clamp a replica count into `[min_count, max_count]`.
    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min_count, self.max_count)
    }
}

impl Default for ScalingPolicy {
    /// Request-count policy of the original tile-server deployment.
    fn default() -> Self {
        Self {
            target_requests_per_replica: 50.0,
            scale_out_cooldown: Duration::from_secs(30),
            scale_in_cooldown: Duration::from_secs(240),
            min_count: 2,
            max_count: 10,
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health status as determined by health gate probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
