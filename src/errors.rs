use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures surfaced by the ask/resolve protocol and its two transports.
#[derive(Debug, Error)]
pub enum LetsPingError {
    #[error("invalid ask: {0}")]
    Validation(String),

    #[error("decision channel unreachable: {0}")]
    Transport(String),

    #[error("request {id} not found")]
    NotFound { id: String },

    #[error("rate limited by decision service")]
    RateLimited,

    #[error("invalid API key or unauthorized access")]
    Authentication,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request {id} timed out waiting for approval")]
    Timeout { id: String },

    #[error("request {id} was superseded by a newer ask with the same id")]
    Superseded { id: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl LetsPingError {
    /// NotFound and RateLimited are absorbed by the poller and retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::RateLimited)
    }

    /// HTTP status associated with the failure, if one was observed.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(404),
            Self::RateLimited => Some(429),
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LetsPingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Api {
                status: e.status().map(|s| s.as_u16()).unwrap_or(200),
                message: format!("undecodable response body: {}", e),
            };
        }
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LetsPingError>;

/// Errors produced by the local ingest gateway. Every variant maps to a
/// bounded HTTP response; none of them terminate the relay.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request {id} was superseded by a newer ask with the same id")]
    Superseded { id: String },

    #[error("request {id} timed out waiting for a decision")]
    HoldTimeout { id: String },

    #[error("decision channel unavailable: {0}")]
    Transport(String),
}

impl From<LetsPingError> for AppError {
    fn from(e: LetsPingError) -> Self {
        match e {
            LetsPingError::Validation(msg) => AppError::InvalidRequest(msg),
            LetsPingError::Json(e) => AppError::InvalidRequest(e.to_string()),
            LetsPingError::Timeout { id } => AppError::HoldTimeout { id },
            LetsPingError::Superseded { id } => AppError::Superseded { id },
            other => AppError::Transport(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::InvalidRequest(detail) => {
                tracing::warn!(detail = %detail, "ingest rejected");
                (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "Invalid Request", "detail": detail }),
                )
            }
            AppError::Superseded { id } => (
                StatusCode::CONFLICT,
                json!({ "error": "Superseded", "id": id }),
            ),
            AppError::HoldTimeout { id } => (
                StatusCode::REQUEST_TIMEOUT,
                json!({ "error": "Timeout", "status": "TIMEOUT", "id": id }),
            ),
            AppError::Transport(e) => {
                tracing::error!("decision channel error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "error": "Decision channel unavailable" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_found_and_rate_limit_are_transient() {
        assert!(LetsPingError::NotFound { id: "req_1".into() }.is_transient());
        assert!(LetsPingError::RateLimited.is_transient());
        assert!(!LetsPingError::Authentication.is_transient());
        assert!(!LetsPingError::Transport("refused".into()).is_transient());
        assert!(!LetsPingError::Api { status: 500, message: "boom".into() }.is_transient());
        assert!(!LetsPingError::Timeout { id: "req_1".into() }.is_transient());
    }

    #[test]
    fn test_timeout_message_names_request() {
        let err = LetsPingError::Timeout { id: "req_abc".into() };
        assert!(err.to_string().contains("req_abc"));
    }

    #[test]
    fn test_app_error_status_codes() {
        let resp = AppError::InvalidRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::HoldTimeout { id: "x".into() }.into_response();
        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);

        let resp = AppError::Superseded { id: "x".into() }.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = AppError::Transport("down".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
