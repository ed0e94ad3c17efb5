// Session endpoints of the CourseHub backend

use anyhow::Context;
use reqwest::{Client, StatusCode};

use super::types::{token_preview, LoginRequest, TokenResponse, UserProfile};
use crate::config::Config;
use crate::error::{message_from_body, RefreshFailure, Result, SessionError};

/// Exchange credentials for an access token
///
/// The backend also sets the refresh cookie on this response.
pub async fn login(client: &Client, config: &Config, request: &LoginRequest) -> Result<String> {
    tracing::info!(email = %request.email, "Logging in...");

    let response = client
        .post(config.api_url("/login"))
        .json(request)
        .send()
        .await
        .map_err(|e| SessionError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = message_from_body(&body);
        tracing::warn!(status = %status, message = %message, "Login rejected");

        if status == StatusCode::UNAUTHORIZED && message.is_empty() {
            return Err(SessionError::Auth("Invalid email or password".to_string()));
        }
        return Err(SessionError::from_status(status, message));
    }

    let data: TokenResponse = response
        .json()
        .await
        .context("Failed to parse login response")?;

    match data.token.filter(|t| !t.is_empty()) {
        Some(token) => {
            tracing::info!(token = %token_preview(&token), "Login succeeded");
            Ok(token)
        }
        None => Err(anyhow::anyhow!("Login response does not contain token").into()),
    }
}

/// Mint a new access token from the refresh cookie
pub async fn refresh_token(
    client: &Client,
    config: &Config,
) -> std::result::Result<String, RefreshFailure> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(config.api_url("/refresh-token"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                RefreshFailure::Timeout
            } else {
                RefreshFailure::Network(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "Token refresh rejected");
        return Err(RefreshFailure::Rejected {
            status: status.as_u16(),
            message: message_from_body(&body),
        });
    }

    let data: TokenResponse = response.json().await.map_err(|e| {
        if e.is_timeout() {
            RefreshFailure::Timeout
        } else {
            tracing::error!(error = %e, "Failed to parse refresh response");
            RefreshFailure::MalformedResponse
        }
    })?;

    match data.token.filter(|t| !t.is_empty()) {
        Some(token) => {
            tracing::info!(token = %token_preview(&token), "Access token refreshed");
            Ok(token)
        }
        None => Err(RefreshFailure::MalformedResponse),
    }
}

/// Load the profile of the token's owner
pub async fn fetch_profile(client: &Client, config: &Config, token: &str) -> Result<UserProfile> {
    tracing::debug!("Loading user profile...");

    let response = client
        .get(config.api_url("/profile"))
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| SessionError::from_transport(&e))?;

    if !response.status().is_success() {
        return Err(SessionError::from_response(response).await);
    }

    let profile: UserProfile = response
        .json()
        .await
        .context("Failed to parse profile response")?;

    tracing::debug!(user_id = %profile.id, role = %profile.role, "User profile loaded");
    Ok(profile)
}

/// Tell the backend to end the session and drop the refresh cookie
pub async fn logout(client: &Client, config: &Config, token: Option<&str>) -> Result<()> {
    let mut request = client
        .post(config.api_url("/logout"))
        .json(&serde_json::json!({}));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| SessionError::from_transport(&e))?;

    if !response.status().is_success() {
        return Err(SessionError::from_response(response).await);
    }
    Ok(())
}
