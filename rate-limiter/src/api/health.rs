//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use llm_rate_limiter_common::HealthResponse;

use crate::state::AppState;

/// GET /health - Reports backend reachability.
///
/// Probes the backend's own `/health` with a short deadline. A degraded
/// backend yields 503 so supervisors can act on the status code alone; the
/// proxy itself keeps serving either way.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.forwarder.probe_health().await;
    let status = if health.status.is_ok() {
        StatusCode::OK
    } else {
        tracing::warn!(
            detail = health.detail.as_deref().unwrap_or(""),
            "backend health degraded"
        );
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
