use std::time::Duration;

use serde_json::Value;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Server error id that triggers a session renewal.
pub const INVALID_SESSION_ERROR_ID: &str = "invalid_session_id";

/// Typed error hierarchy for backend operations.
///
/// `Clone` so one failed session fetch can be handed to every caller that
/// joined it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    // Network or socket failure
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream did not open within {0:?}")]
    OpenTimeout(Duration),

    // Server-side
    /// `details` is the decoded response body of the rejected call.
    #[error("session invalid: {message}")]
    SessionInvalid { message: String, details: Value },
    #[error("{message} ({code})")]
    Api {
        code: String,
        message: String,
        details: Value,
    },

    // Local
    #[error("decode error: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// True when the caller should retry the same payload over the
    /// synchronous HTTP endpoint instead of the stream.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::OpenTimeout(_) | Self::Transport(_))
    }

    /// Server error id (`error_id`) or HTTP status carried by an API error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            Self::SessionInvalid { .. } => Some(INVALID_SESSION_ERROR_ID),
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::OpenTimeout(_) => "open_timeout",
            Self::SessionInvalid { .. } => "session_invalid",
            Self::Api { .. } => "api",
            Self::Decode(_) => "decode",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_classification() {
        assert!(ClientError::OpenTimeout(Duration::from_secs(4)).is_fallback_eligible());
        assert!(ClientError::Transport("refused".into()).is_fallback_eligible());
        assert!(!ClientError::Decode("bad frame".into()).is_fallback_eligible());
        assert!(!ClientError::Cancelled.is_fallback_eligible());
        let api = ClientError::Api {
            code: "no_model".into(),
            message: "No model selected".into(),
            details: Value::Null,
        };
        assert!(!api.is_fallback_eligible());
    }

    #[test]
    fn api_error_display_and_code() {
        let err = ClientError::Api {
            code: "500".into(),
            message: "Request failed".into(),
            details: serde_json::json!({}),
        };
        assert_eq!(err.to_string(), "Request failed (500)");
        assert_eq!(err.code(), Some("500"));
        assert_eq!(ClientError::Cancelled.code(), None);
    }

    #[test]
    fn session_invalid_keeps_response_details() {
        let details = serde_json::json!({"error": "Invalid session ID", "error_id": "invalid_session_id"});
        let err = ClientError::SessionInvalid {
            message: "Invalid session ID".into(),
            details: details.clone(),
        };
        assert_eq!(err.to_string(), "session invalid: Invalid session ID");
        assert_eq!(err.code(), Some(INVALID_SESSION_ERROR_ID));
        assert_eq!(err.error_kind(), "session_invalid");
        let ClientError::SessionInvalid { details: kept, .. } = err else {
            panic!("expected session invalid");
        };
        assert_eq!(kept, details);
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ClientError::Cancelled.error_kind(), "cancelled");
        assert_eq!(ClientError::OpenTimeout(Duration::ZERO).error_kind(), "open_timeout");
        assert_eq!(ClientError::Decode("eof".into()).error_kind(), "decode");
    }

    #[test]
    fn serde_error_converts_to_decode() {
        let err: ClientError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert!(matches!(err, ClientError::Decode(_)));
    }
}
