//! tilescale-pool: the set of worker replicas behind the load balancer.
//!
//! The pool turns a desired replica count into launch/terminate calls on
//! an orchestration substrate, and reports as capacity only the replicas
//! the health gate has admitted.
//!
//! # Architecture
//!
//! ```text
//! ReplicaPool
//!   ├── set_desired_count(n) → bounds check → reconcile()
//!   │   └── Orchestrator::launch() / terminate()
//!   ├── poll_health()
//!   │   ├── HealthGate::probe() per replica (concurrent)
//!   │   ├── HealthTracker (consecutive successes / failures)
//!   │   └── replace demoted replicas, reconcile()
//!   └── current_count() → admitted replicas only
//! ```
//!
//! Launches are fire-and-forget: a replica joins the pool as soon as the
//! orchestrator accepts it, but only counts toward `current_count` once a
//! health poll admits it.

pub mod error;
pub mod health;
pub mod orchestrator;
pub mod pool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{PoolError, PoolResult};
pub use health::{HealthGate, HealthTracker, HttpHealthGate, ProbeResult};
pub use orchestrator::{CommandOrchestrator, Orchestrator, Replica};
pub use pool::{HealthReport, ReplicaPool, ReplicaView};
