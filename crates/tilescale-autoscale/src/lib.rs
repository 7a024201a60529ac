//! tilescale-autoscale: request-rate-driven replica scaling.
//!
//! Consumes `MetricSample`s, computes a target replica count, and drives
//! a `ReplicaPool` toward it, subject to replica bounds and two
//! independent cooldown timers.
//!
//! # Scaling Algorithm
//!
//! ```text
//! desired = ceil(current * requests_per_replica / target_requests_per_replica)
//! desired = clamp(desired, min_count, max_count)
//!
//! desired > current  →  scale out, unless now - last_scale_out < scale_out_cooldown
//! desired < current  →  scale in,  unless now - last_scale_in  < scale_in_cooldown
//! otherwise          →  no change
//! ```
//!
//! Scale-out reacts fast (default 30s cooldown) to avoid overload;
//! scale-in reacts slowly (default 240s) to avoid thrashing on bursty
//! traffic. The two timers are independent, so an out and an in decision
//! can both be cooling down at once.

pub mod control_loop;
pub mod error;
pub mod scaler;

pub use control_loop::{ControlLoop, ControllerStatus};
pub use error::{AutoscaleError, AutoscaleResult};
pub use scaler::{Autoscaler, ControllerState, ScaleDecision, ScaleDirection};
