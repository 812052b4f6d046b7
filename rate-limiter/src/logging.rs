//! Tracing setup and request logging.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Paths answered by the proxy itself. Monitoring polls them constantly.
fn is_introspection(path: &str) -> bool {
    path == "/health" || path.starts_with("/proxy/")
}

/// Middleware that logs one line per HTTP request.
///
/// Forwarded requests log at INFO, or WARN when the proxy answers with an
/// error of its own (502/503/504). Introspection endpoints log at DEBUG. The
/// duration covers admission and the backend's response head; streaming
/// continues after this line is written.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if is_introspection(&path) {
        tracing::debug!(method = %method, path = %path, status, duration_ms, "introspection request");
    } else if matches!(status, 502..=504) {
        tracing::warn!(method = %method, path = %path, status, duration_ms, "proxy error response");
    } else {
        tracing::info!(method = %method, path = %path, status, duration_ms, "forwarded request");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_introspection_paths() {
        assert!(is_introspection("/health"));
        assert!(is_introspection("/proxy/stats"));
        assert!(is_introspection("/proxy/metrics"));
        assert!(!is_introspection("/v1/completions"));
        assert!(!is_introspection("/healthz"));
    }
}
