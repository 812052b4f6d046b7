//! Error types for the rate limiter.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llm_rate_limiter_common::ErrorBody;

use crate::config::ConfigError;
use crate::gate::AdmissionError;
use crate::stats::Outcome;

/// Fatal errors raised before the proxy starts serving.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build backend HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Failed to launch backend: {0}")]
    Launch(String),
}

/// Per-request failures. Each one is answered to its own client and never
/// touches other requests.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("backend busy, timeout waiting for slot")]
    AdmissionTimeout,

    #[error("backend busy, queue full")]
    QueueFull,

    #[error("proxy shutting down")]
    ShuttingDown,

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("failed to read request body: {0}")]
    BadRequestBody(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend timeout after {}s", .0.as_secs())]
    BackendTimeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend stream failed: {0}")]
    Stream(String),
}

impl ProxyError {
    /// Classify a reqwest failure on the forwarded call. No retries happen here.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_connect() {
            ProxyError::BackendUnreachable(err.to_string())
        } else if err.is_timeout() {
            ProxyError::BackendTimeout(timeout)
        } else {
            ProxyError::Backend(err.to_string())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AdmissionTimeout | ProxyError::QueueFull | ProxyError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BadRequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::BackendUnreachable(_) | ProxyError::Backend(_) | ProxyError::Stream(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Outcome recorded for an admitted request that failed this way.
    pub fn outcome(&self) -> Outcome {
        match self {
            ProxyError::BackendUnreachable(_) => Outcome::BackendUnreachable,
            ProxyError::BackendTimeout(_) => Outcome::BackendTimeout,
            _ => Outcome::BackendError,
        }
    }
}

impl From<AdmissionError> for ProxyError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Timeout(_) => ProxyError::AdmissionTimeout,
            AdmissionError::QueueFull { .. } => ProxyError::QueueFull,
            AdmissionError::Closed => ProxyError::ShuttingDown,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::AdmissionTimeout.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::QueueFull.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::ShuttingDown.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::BodyTooLarge(10).status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ProxyError::BackendUnreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BackendTimeout(Duration::from_secs(300)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_admission_timeout_message() {
        assert_eq!(
            ProxyError::AdmissionTimeout.to_string(),
            "backend busy, timeout waiting for slot"
        );
        assert_eq!(
            ProxyError::BackendTimeout(Duration::from_secs(300)).to_string(),
            "backend timeout after 300s"
        );
    }

    #[test]
    fn test_admission_error_conversion() {
        let err: ProxyError = AdmissionError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, ProxyError::AdmissionTimeout));

        let err: ProxyError = AdmissionError::QueueFull { limit: 4 }.into();
        assert!(matches!(err, ProxyError::QueueFull));

        let err: ProxyError = AdmissionError::Closed.into();
        assert!(matches!(err, ProxyError::ShuttingDown));
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            ProxyError::BackendUnreachable("x".into()).outcome(),
            Outcome::BackendUnreachable
        );
        assert_eq!(
            ProxyError::BackendTimeout(Duration::from_secs(1)).outcome(),
            Outcome::BackendTimeout
        );
        assert_eq!(ProxyError::Backend("x".into()).outcome(), Outcome::BackendError);
    }
}
