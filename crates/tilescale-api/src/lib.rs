//! tilescale-api: HTTP surface of the tilescale daemon.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/samples` | Push a metric sample to the controller |
//! | POST | `/api/v1/requests` | Record load-balancer request counts |
//! | GET | `/api/v1/status` | Controller and replica pool status |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::{mpsc, watch};

use tilescale_autoscale::ControllerStatus;
use tilescale_core::MetricSample;
use tilescale_metrics::RequestAggregator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Sender side of the control loop's sample channel.
    pub samples: mpsc::Sender<MetricSample>,
    pub aggregator: Arc<RequestAggregator>,
    pub status: watch::Receiver<ControllerStatus>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/samples", post(handlers::push_sample))
        .route("/requests", post(handlers::record_requests))
        .route("/status", get(handlers::get_status))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
