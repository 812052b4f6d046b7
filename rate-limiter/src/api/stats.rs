//! Statistics endpoints.

use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use llm_rate_limiter_common::StatsSnapshot;

use crate::state::AppState;

/// GET /proxy/stats - Current aggregate statistics.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.snapshot())
}

/// GET /proxy/metrics - The same counters in Prometheus text format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = render_metrics(&state.snapshot());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

fn render_metrics(s: &StatsSnapshot) -> String {
    let metrics: [(&str, &str, &str, u64); 10] = [
        ("requests_total", "counter", "Requests that received a terminal response", s.total_requests),
        ("active_requests", "gauge", "Requests holding a gate slot", s.active_requests),
        ("queued_requests", "gauge", "Requests waiting for a gate slot", s.queued_requests),
        ("rejected_requests_total", "counter", "Requests refused without being forwarded", s.rejected_requests),
        ("errors_total", "counter", "Forwarded requests that failed in the proxy", s.total_errors),
        ("bytes_forwarded_total", "counter", "Request and response body bytes forwarded", s.total_bytes_forwarded),
        ("client_disconnects_total", "counter", "Forwarded requests abandoned by the client", s.client_disconnects),
        ("max_concurrent", "gauge", "Gate capacity", s.max_concurrent),
        ("available_slots", "gauge", "Free gate slots", s.available_slots),
        ("uptime_seconds", "gauge", "Seconds since the proxy started", s.uptime_secs),
    ];

    let mut out = String::new();
    for (name, kind, help, value) in metrics {
        let _ = writeln!(out, "# HELP llm_rate_limiter_{} {}", name, help);
        let _ = writeln!(out, "# TYPE llm_rate_limiter_{} {}", name, kind);
        let _ = writeln!(out, "llm_rate_limiter_{} {}", name, value);
    }
    let _ = writeln!(out, "# HELP llm_rate_limiter_slot_utilization Fraction of gate slots held");
    let _ = writeln!(out, "# TYPE llm_rate_limiter_slot_utilization gauge");
    let _ = writeln!(out, "llm_rate_limiter_slot_utilization {}", s.utilization());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::router;
    use crate::config::Config;

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.limits.max_concurrent = 2;
        Arc::new(AppState::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let app = router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/proxy/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: StatsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.max_concurrent, 2);
        assert_eq!(stats.available_slots, 2);
    }

    #[tokio::test]
    async fn test_stats_while_gate_saturated() {
        let state = test_state();
        let _a = state.gate.acquire(std::time::Duration::from_secs(1)).await.unwrap();
        let _b = state.gate.acquire(std::time::Duration::from_secs(1)).await.unwrap();

        let response = router(state.clone())
            .oneshot(Request::builder().uri("/proxy/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: StatsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.available_slots, 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state();
        state.stats.record_rejected();

        let response = router(state)
            .oneshot(Request::builder().uri("/proxy/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE llm_rate_limiter_requests_total counter"));
        assert!(text.contains("llm_rate_limiter_rejected_requests_total 1"));
        assert!(text.contains("llm_rate_limiter_max_concurrent 2"));
    }

    #[tokio::test]
    async fn test_metrics_report_slot_utilization() {
        let state = test_state();
        let _held = state.gate.acquire(std::time::Duration::from_secs(1)).await.unwrap();

        let response = router(state)
            .oneshot(Request::builder().uri("/proxy/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE llm_rate_limiter_slot_utilization gauge"));
        assert!(text.contains("llm_rate_limiter_slot_utilization 0.5\n"));
        assert!(text.contains("llm_rate_limiter_available_slots 1\n"));
    }
}
