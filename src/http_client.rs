use anyhow::Context;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, Response};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CookieJar, RefreshCoordinator, TokenStore};
use crate::config::Config;
use crate::error::{transport_error_kind, Result, SessionError};

/// Description of a backend call, independent of the current token
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the API root, e.g. `/courses/3`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).json(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Build the shared reqwest client
///
/// The cookie jar carries the refresh credential set by the login response.
pub fn build_client(config: &Config, cookies: &CookieJar) -> anyhow::Result<Client> {
    Client::builder()
        .cookie_provider(cookies.provider())
        .connect_timeout(Duration::from_secs(config.http_connect_timeout))
        .timeout(Duration::from_secs(config.http_request_timeout))
        .build()
        .context("Failed to create HTTP client")
}

/// HTTP client for the CourseHub API with bearer auth and refresh-on-401
pub struct SessionHttpClient {
    client: Client,
    config: Arc<Config>,
    store: Arc<TokenStore>,
    refresher: RefreshCoordinator,
}

impl SessionHttpClient {
    pub(crate) fn new(
        client: Client,
        config: Arc<Config>,
        store: Arc<TokenStore>,
        refresher: RefreshCoordinator,
    ) -> Self {
        Self {
            client,
            config,
            store,
            refresher,
        }
    }

    /// Execute a request on behalf of the current session
    ///
    /// A 401 is answered by a (shared) token refresh and a single resend with the
    /// new token; a second 401 propagates. Every other failure propagates as-is.
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let request = self.build(&descriptor)?;
        let sent_token = self.store.get();

        let mut attempt = clone_request(&request)?;
        if let Some(ref token) = sent_token {
            with_bearer(&mut attempt, token)?;
        }

        tracing::debug!(
            request_id = %request_id,
            method = %descriptor.method,
            path = %descriptor.path,
            authenticated = sent_token.is_some(),
            "Sending request"
        );

        let err = match send(&self.client, attempt).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        if !err.is_auth_failure() {
            return Err(err);
        }

        // Token was rotated while this request was in flight
        let current = self.store.get();
        if let Some(token) = current.as_deref() {
            if current != sent_token {
                tracing::debug!(
                    request_id = %request_id,
                    "Token changed since request was sent, resending with current token"
                );
                let mut retry = request;
                with_bearer(&mut retry, token)?;
                return send(&self.client, retry).await;
            }
        }

        tracing::warn!(
            request_id = %request_id,
            path = %descriptor.path,
            "Received 401, waiting for token refresh"
        );
        self.refresher.retry_after_refresh(request, err).await
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn build(&self, descriptor: &RequestDescriptor) -> Result<Request> {
        let mut builder = self
            .client
            .request(descriptor.method.clone(), self.config.api_url(&descriptor.path));

        if !descriptor.query.is_empty() {
            builder = builder.query(&descriptor.query);
        }

        for (name, value) in &descriptor.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| SessionError::InvalidInput(format!("Invalid header name: {}", name)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                SessionError::InvalidInput(format!("Invalid value for header {}", name))
            })?;
            builder = builder.header(name, value);
        }

        if let Some(ref body) = descriptor.body {
            builder = builder.json(body);
        }

        builder
            .build()
            .context("Failed to build request")
            .map_err(SessionError::from)
    }
}

/// Copy a request for another attempt
pub(crate) fn clone_request(request: &Request) -> Result<Request> {
    request
        .try_clone()
        .ok_or_else(|| SessionError::Internal(anyhow::anyhow!("Request body is not cloneable")))
}

/// Set (or replace) the bearer token on a request
pub(crate) fn with_bearer(request: &mut Request, token: &str) -> Result<()> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| SessionError::Internal(anyhow::anyhow!("Access token is not a valid header")))?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

/// Execute a request once and classify the outcome
pub(crate) async fn send(client: &Client, request: Request) -> Result<Response> {
    let method = request.method().clone();
    let url = request.url().clone();

    match client.execute(request).await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = %status, method = %method, url = %url, "Request successful");
                return Ok(response);
            }

            tracing::warn!(
                status = %status,
                method = %method,
                url = %url,
                "Received error response"
            );
            Err(SessionError::from_response(response).await)
        }
        Err(e) => {
            tracing::warn!(
                error_kind = transport_error_kind(&e),
                error = %e,
                method = %method,
                url = %url,
                "HTTP request error"
            );
            Err(SessionError::from_transport(&e))
        }
    }
}
