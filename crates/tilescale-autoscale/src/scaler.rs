//! Autoscaler: turns metric samples into replica-count decisions.
//!
//! `evaluate()` is the pure decision step: it never talks to the pool.
//! `tick()` evaluates and then applies the decision, rolling the cooldown
//! timers back if the pool could not take it.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use tilescale_core::{MetricSample, ScalingPolicy};
use tilescale_pool::ReplicaPool;

use crate::error::{AutoscaleError, AutoscaleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Out,
    In,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Out => f.write_str("out"),
            ScaleDirection::In => f.write_str("in"),
        }
    }
}

/// Result of evaluating one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleDecision {
    /// Set the pool's desired count to `count`.
    ScaleTo { direction: ScaleDirection, count: u32 },
    /// A change was wanted but its direction is still cooling down.
    Suppressed {
        direction: ScaleDirection,
        desired: u32,
        retry_in: Duration,
    },
    /// Load matches current capacity.
    NoChange,
}

impl ScaleDecision {
    /// The count to apply, if this decision changes anything.
    pub fn target(&self) -> Option<u32> {
        match self {
            ScaleDecision::ScaleTo { count, .. } => Some(*count),
            _ => None,
        }
    }
}

/// Per-controller timers. Only the controller writes these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerState {
    /// Timestamp of the last applied scale-out. `None` = cooldown expired.
    pub last_scale_out_at: Option<u64>,
    /// Timestamp of the last applied scale-in. `None` = cooldown expired.
    pub last_scale_in_at: Option<u64>,
    /// Count last issued to the pool and not yet observed as ready.
    pub pending_target: Option<u32>,
    /// Timestamp of the last valid sample evaluated.
    pub last_evaluated_at: Option<u64>,
}

/// The autoscaling controller for a single replica pool.
pub struct Autoscaler {
    policy: ScalingPolicy,
    state: ControllerState,
    dropped_samples: u64,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            state: ControllerState::default(),
            dropped_samples: 0,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Samples rejected as invalid since start.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Proportional target for `current` replicas at the sampled load,
    /// clamped to the policy bounds.
    pub fn desired_count(&self, sample: &MetricSample, current: u32) -> u32 {
        let raw = (current as f64 * sample.requests_per_replica
            / self.policy.target_requests_per_replica())
        .ceil();

        if raw >= self.policy.max_count() as f64 {
            self.policy.max_count()
        } else {
            // `raw` is finite, non-negative, and below max_count here.
            self.policy.clamp(raw as u32)
        }
    }

    /// Decide what to do with one sample, given the pool's ready count.
    ///
    /// The sample's timestamp is the clock for cooldowns. A non-suppressed
    /// decision stamps the matching timer and records the pending target.
    pub fn evaluate(
        &mut self,
        sample: &MetricSample,
        current: u32,
    ) -> AutoscaleResult<ScaleDecision> {
        self.evaluate_against(sample, current, current)
    }

    /// Like [`evaluate`](Self::evaluate), but while replicas are still
    /// starting the direction is judged against `committed`, the count the
    /// pool was last told to hold. The target is still sized from the ready
    /// count. Any target below `committed` removes replicas and so must
    /// clear the scale-in cooldown.
    pub fn evaluate_against(
        &mut self,
        sample: &MetricSample,
        current: u32,
        committed: u32,
    ) -> AutoscaleResult<ScaleDecision> {
        if !sample.is_valid() {
            self.dropped_samples += 1;
            warn!(
                requests_per_replica = sample.requests_per_replica,
                timestamp = sample.timestamp,
                "dropping invalid metric sample"
            );
            return Err(AutoscaleError::InvalidSample {
                value: sample.requests_per_replica,
            });
        }

        let now = sample.timestamp;
        self.state.last_evaluated_at = Some(now);
        if self.state.pending_target == Some(current) {
            self.state.pending_target = None;
        }

        let desired = self.desired_count(sample, current);
        let direction = match desired.cmp(&committed) {
            Ordering::Greater => ScaleDirection::Out,
            Ordering::Less => ScaleDirection::In,
            Ordering::Equal => {
                debug!(
                    current,
                    committed,
                    requests_per_replica = sample.requests_per_replica,
                    "load matches capacity"
                );
                return Ok(ScaleDecision::NoChange);
            }
        };

        let (last, cooldown) = match direction {
            ScaleDirection::Out => (self.state.last_scale_out_at, self.policy.scale_out_cooldown()),
            ScaleDirection::In => (self.state.last_scale_in_at, self.policy.scale_in_cooldown()),
        };

        if let Some(retry_in) = cooldown_remaining(last, cooldown, now) {
            debug!(
                %direction,
                current,
                committed,
                desired,
                retry_in_secs = retry_in.as_secs(),
                "scale decision suppressed by cooldown"
            );
            return Ok(ScaleDecision::Suppressed {
                direction,
                desired,
                retry_in,
            });
        }

        match direction {
            ScaleDirection::Out => self.state.last_scale_out_at = Some(now),
            ScaleDirection::In => self.state.last_scale_in_at = Some(now),
        }
        self.state.pending_target = Some(desired);

        debug!(
            %direction,
            from = committed,
            ready = current,
            to = desired,
            requests_per_replica = sample.requests_per_replica,
            target = self.policy.target_requests_per_replica(),
            "scale decision"
        );
        Ok(ScaleDecision::ScaleTo {
            direction,
            count: desired,
        })
    }

    /// Evaluate a sample against the pool and apply the decision.
    ///
    /// If the pool fails to apply it, the timers and pending target are
    /// restored so the next tick can retry the same direction.
    pub async fn tick(
        &mut self,
        sample: &MetricSample,
        pool: &mut ReplicaPool,
    ) -> AutoscaleResult<ScaleDecision> {
        let before = self.state;
        let current = pool.current_count();
        let committed = pool.desired_count();
        let decision = self.evaluate_against(sample, current, committed)?;

        if let ScaleDecision::ScaleTo { direction, count } = decision {
            if let Err(e) = pool.set_desired_count(count).await {
                self.state.last_scale_out_at = before.last_scale_out_at;
                self.state.last_scale_in_at = before.last_scale_in_at;
                self.state.pending_target = before.pending_target;
                warn!(
                    %direction,
                    from = committed,
                    to = count,
                    error = %e,
                    retryable = e.is_retryable(),
                    "scaling action failed"
                );
                return Err(e.into());
            }
            info!(%direction, from = committed, ready = current, to = count, "scaled");
        }

        Ok(decision)
    }
}

/// Time left before `cooldown` has elapsed since `last`, or `None` if it
/// already has. A timestamp earlier than `last` counts as no time elapsed.
fn cooldown_remaining(last: Option<u64>, cooldown: Duration, now: u64) -> Option<Duration> {
    let last = last?;
    let elapsed = Duration::from_secs(now.saturating_sub(last));
    if elapsed >= cooldown {
        None
    } else {
        Some(cooldown - elapsed)
    }
}
