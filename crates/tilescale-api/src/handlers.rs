//! REST API handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use tilescale_core::{MetricSample, epoch_secs};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Metric ingestion ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SampleRequest {
    pub requests_per_replica: f64,
    /// Defaults to the time of receipt.
    pub timestamp: Option<u64>,
}

/// POST /api/v1/samples
///
/// Forwards the sample as-is; validity is judged by the controller and
/// shows up in `/api/v1/status` as `dropped_samples`.
pub async fn push_sample(
    State(state): State<ApiState>,
    Json(req): Json<SampleRequest>,
) -> impl IntoResponse {
    let sample = MetricSample::new(
        req.requests_per_replica,
        req.timestamp.unwrap_or_else(epoch_secs),
    );

    match state.samples.try_send(sample) {
        Ok(()) => {
            debug!(
                requests_per_replica = sample.requests_per_replica,
                timestamp = sample.timestamp,
                "sample accepted"
            );
            (StatusCode::ACCEPTED, ApiResponse::ok(sample)).into_response()
        }
        Err(TrySendError::Full(_)) => {
            warn!("sample channel full, rejecting sample");
            error_response("controller busy, retry later", StatusCode::SERVICE_UNAVAILABLE)
                .into_response()
        }
        Err(TrySendError::Closed(_)) => {
            error_response("controller stopped", StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RequestCount {
    pub count: u64,
}

/// POST /api/v1/requests
pub async fn record_requests(
    State(state): State<ApiState>,
    Json(req): Json<RequestCount>,
) -> impl IntoResponse {
    state.aggregator.record(req.count);
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({
            "recorded": req.count,
            "window": state.aggregator.pending(),
        })),
    )
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    ApiResponse::ok(status)
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = tilescale_metrics::render_prometheus(&state.status.borrow());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
