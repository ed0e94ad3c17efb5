// Error handling module
// Defines the session client error taxonomy and response classification

use reqwest::{Response, StatusCode};
use thiserror::Error;

/// Reasons a token refresh can fail
///
/// Cloneable so a single refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshFailure {
    /// No session exists, nothing to refresh
    #[error("no active session to refresh")]
    NoSession,

    /// Refresh endpoint unreachable
    #[error("refresh request failed: {0}")]
    Network(String),

    /// Refresh endpoint did not answer in time
    #[error("refresh request timed out")]
    Timeout,

    /// Refresh credential rejected by the backend
    #[error("refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// 2xx response without a usable token
    #[error("refresh response does not contain a token")]
    MalformedResponse,

    /// New token could not be persisted
    #[error("failed to persist refreshed token: {0}")]
    Storage(String),

    /// Session ended while the refresh was in flight
    #[error("refresh cancelled by logout")]
    Cancelled,

    /// Refresh task panicked or was aborted
    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// Errors surfaced by the session client
#[derive(Error, Debug)]
pub enum SessionError {
    /// No response was received
    #[error("Network failure: {0}")]
    Network(String),

    /// 401 from the backend
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Any other 4xx from the backend
    #[error("Validation error: {status} - {message}")]
    Validation { status: u16, message: String },

    /// 5xx from the backend
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Rejected locally before any request was sent
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Token refresh failed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    /// Durable token storage error
    #[error("Token storage error: {0}")]
    Storage(String),

    /// The session was logged out while the operation was in flight
    #[error("Operation cancelled by logout")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// Classify a non-success status code
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 => SessionError::Auth(message),
            code @ 400..=499 => SessionError::Validation {
                status: code,
                message,
            },
            code => SessionError::Server {
                status: code,
                message,
            },
        }
    }

    /// Build an error from a failed response, consuming its body for the message
    pub async fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, message_from_body(&body))
    }

    /// Build an error from a transport-level failure
    pub fn from_transport(err: &reqwest::Error) -> Self {
        SessionError::Network(format!("{} (kind: {})", err, transport_error_kind(err)))
    }

    /// Whether this is a 401-class failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }

    /// HTTP status carried by the error, if it came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            SessionError::Auth(_) => Some(401),
            SessionError::Validation { status, .. } | SessionError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Categorize a reqwest error for logs
pub(crate) fn transport_error_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection_failed"
    } else if err.is_request() {
        "request_error"
    } else if err.is_body() {
        "body_error"
    } else if err.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Pull a human readable message out of an error body
///
/// Accepts `{"message": ...}`, `{"error": {"message": ...}}` and `{"error": "..."}`,
/// otherwise returns the body as-is.
pub(crate) fn message_from_body(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let message = json
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| {
                json.get("error")
                    .and_then(|e| e.get("message").and_then(|v| v.as_str()).or(e.as_str()))
            });
        if let Some(message) = message {
            return message.to_string();
        }
    }
    body.trim().to_string()
}
