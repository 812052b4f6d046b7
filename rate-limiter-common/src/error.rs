//! Error body used by every proxy-generated failure response.

use serde::{Deserialize, Serialize};

/// `{"error": "<message>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("backend busy, timeout waiting for slot");
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"backend busy, timeout waiting for slot"}"#);
    }
}
