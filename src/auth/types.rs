// Session types

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

// Unanchored: any `x@y.z` run inside the input is accepted
static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+@\S+\.\S+").unwrap());

const MIN_PASSWORD_LENGTH: usize = 6;

/// Lifecycle state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Restoring the session from persisted data at startup
    Bootstrapping,
    Unauthenticated,
    Authenticated,
    /// Access token rejected, refresh in flight
    Refreshing,
}

impl SessionStatus {
    /// Whether a token is held in this state
    pub fn has_token(self) -> bool {
        matches!(self, SessionStatus::Authenticated | SessionStatus::Refreshing)
    }
}

/// Profile of the logged in user, as returned by `GET /profile`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: serde_json::Value,
    pub name: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "student".to_string()
}

/// Point-in-time view of the session handed to observers
///
/// Status and user always change together in a single update.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub user: Option<UserProfile>,
}

impl SessionSnapshot {
    pub fn bootstrapping() -> Self {
        Self {
            status: SessionStatus::Bootstrapping,
            user: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status.has_token()
    }

    pub fn is_loading(&self) -> bool {
        self.status == SessionStatus::Bootstrapping
    }
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Check credentials before anything is sent
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.email.is_empty() {
            return Err(SessionError::InvalidInput("Email is required".to_string()));
        }
        if !EMAIL_PATTERN.is_match(&self.email) {
            return Err(SessionError::InvalidInput("Email is invalid".to_string()));
        }
        if self.password.is_empty() {
            return Err(SessionError::InvalidInput(
                "Password is required".to_string(),
            ));
        }
        if self.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(SessionError::InvalidInput(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }
        Ok(())
    }
}

/// Response of `POST /login` and `POST /refresh-token`
///
/// `token` is optional so a 2xx without it can be told apart from a parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: Option<String>,
}

/// Durable record of the access token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredToken {
    pub access_token: String,
    pub saved_at: DateTime<Utc>,
}

impl StoredToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            saved_at: Utc::now(),
        }
    }
}

/// First characters of a token, for logs
pub(crate) fn token_preview(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}
