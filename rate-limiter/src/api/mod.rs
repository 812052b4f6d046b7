//! HTTP surface of the proxy.
//!
//! `/health`, `/proxy/stats` and `/proxy/metrics` are answered here without
//! touching the gate. Every other path and method falls through to the
//! forwarding handler.

pub mod health;
pub mod proxy;
pub mod stats;

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::logging::request_logger;
use crate::state::AppState;

/// Build the proxy router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/proxy/stats", get(stats::stats))
        .route("/proxy/metrics", get(stats::metrics))
        .fallback(proxy::forward)
        .layer(middleware::from_fn(request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
