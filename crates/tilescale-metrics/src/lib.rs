//! tilescale-metrics: the metric source that feeds the controller.
//!
//! # Architecture
//!
//! ```text
//! RequestAggregator
//!   ├── record(count)  ← load-balancer request counts
//!   ├── take_sample(ready) → MetricSample (count / ready replicas)
//!   └── run() → emits one sample per interval on an mpsc channel
//!
//! Prometheus exposition
//!   └── render_prometheus(&ControllerStatus) → text/plain for /metrics
//! ```

pub mod aggregator;
pub mod prometheus;

pub use aggregator::RequestAggregator;
pub use prometheus::render_prometheus;
