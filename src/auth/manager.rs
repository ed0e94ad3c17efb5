use anyhow::Context;
use chrono::Utc;
use reqwest::{Client, Response};
use std::sync::Arc;
use tokio::sync::watch;

use super::api;
use super::cookies::{cookie_file_for, CookieJar};
use super::refresh::RefreshCoordinator;
use super::state::SessionCore;
use super::storage::SqlitePersistence;
use super::token_store::{Subscription, TokenStore};
use super::types::{LoginRequest, SessionSnapshot, SessionStatus, UserProfile};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::http_client::{self, RequestDescriptor, SessionHttpClient};

/// Session manager
/// Owns the session for the lifetime of the application: login, logout,
/// bootstrap from the persisted token, and the observable user/status snapshot.
/// Screens receive a handle to it rather than reaching for global state.
pub struct SessionManager {
    config: Arc<Config>,
    client: Client,
    core: Arc<SessionCore>,
    refresher: RefreshCoordinator,
    http: Arc<SessionHttpClient>,
    cookies: Arc<CookieJar>,
    _cookie_sync: Subscription,
}

impl SessionManager {
    /// Create a session manager persisting its token in the configured SQLite file
    ///
    /// Cookies (the refresh credential) are kept in a file beside the database.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        tracing::info!(
            "Opening token database: {}",
            config.token_db_file.display()
        );
        let persistence = SqlitePersistence::open(&config.token_db_file)?;
        let cookies = CookieJar::open(cookie_file_for(&config.token_db_file));
        Self::with_parts(config, TokenStore::new(persistence), cookies)
    }

    /// Create a session manager over an existing token store, cookies kept in memory
    pub fn with_store(config: Config, store: TokenStore) -> anyhow::Result<Self> {
        Self::with_parts(config, store, CookieJar::in_memory())
    }

    /// Create a session manager over an existing token store and cookie jar
    ///
    /// The jar is saved whenever a token is stored and cleared with it.
    pub fn with_parts(
        config: Config,
        store: TokenStore,
        cookies: CookieJar,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let cookies = Arc::new(cookies);
        let client = http_client::build_client(&config, &cookies)?;
        let store = Arc::new(store);

        let jar = cookies.clone();
        let cookie_sync = store.subscribe(move |token| sync_cookies(&jar, token));

        let core = Arc::new(SessionCore::new(store.clone()));
        let refresher = RefreshCoordinator::new(client.clone(), config.clone(), core.clone());
        let http = Arc::new(SessionHttpClient::new(
            client.clone(),
            config.clone(),
            store,
            refresher.clone(),
        ));

        Ok(Self {
            config,
            client,
            core,
            refresher,
            http,
            cookies,
            _cookie_sync: cookie_sync,
        })
    }

    /// Restore the session from the persisted token
    ///
    /// Settles on `Authenticated` or `Unauthenticated`; `loading` is false afterwards.
    pub async fn bootstrap(&self) -> SessionStatus {
        let store = self.core.store();
        let Some(token) = store.get() else {
            tracing::info!("No persisted session");
            self.core.settle(SessionStatus::Unauthenticated);
            return self.status();
        };

        if let Some(saved_at) = store.saved_at() {
            let age = Utc::now() - saved_at;
            tracing::info!(age_minutes = age.num_minutes(), "Restoring persisted session");
        }

        let lifetime = self.core.lifetime();
        match self
            .core
            .load_profile(&self.client, &self.config, &lifetime, &token)
            .await
        {
            Ok(user) => {
                tracing::info!(email = %user.email, "Session restored");
            }
            Err(SessionError::Cancelled) => {}
            Err(e) if e.is_auth_failure() => {
                tracing::info!("Persisted token rejected, attempting refresh");
                self.recover_bootstrap().await;
            }
            Err(e) => {
                // Keep the token: the backend may simply be unreachable right now
                tracing::warn!(error = %e, "Could not load profile, keeping persisted token");
                self.core.settle(SessionStatus::Authenticated);
            }
        }

        // A cancelled profile load leaves bootstrapping unsettled
        if self.core.store().get().is_some() {
            self.core.settle(SessionStatus::Authenticated);
        } else {
            self.core.settle(SessionStatus::Unauthenticated);
        }
        self.status()
    }

    /// One refresh and one profile reload, otherwise the session ends
    async fn recover_bootstrap(&self) {
        let token = match self.refresher.refresh().await {
            Ok(token) => token,
            Err(failure) => {
                tracing::warn!(error = %failure, "Could not refresh persisted session");
                self.core.revoke("bootstrap refresh failed");
                return;
            }
        };

        let lifetime = self.core.lifetime();
        match self
            .core
            .load_profile(&self.client, &self.config, &lifetime, &token)
            .await
        {
            Ok(user) => tracing::info!(email = %user.email, "Session restored after refresh"),
            Err(SessionError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Profile still unavailable after refresh");
                self.core.revoke("bootstrap profile load failed");
            }
        }
    }

    /// Log in with email and password
    ///
    /// On failure the session is left as it was and the error is returned.
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        let request = LoginRequest::new(email, password);
        request.validate()?;

        let lifetime = self.core.lifetime();
        let token = api::login(&self.client, &self.config, &request).await?;
        self.core.commit_token(&lifetime, &token)?;

        match self
            .core
            .load_profile(&self.client, &self.config, &lifetime, &token)
            .await
        {
            Ok(user) => {
                tracing::info!(email = %user.email, role = %user.role, "Logged in");
                Ok(())
            }
            Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load profile after login");
                self.core.revoke("profile load after login failed");
                Err(e)
            }
        }
    }

    /// Log out
    ///
    /// In-flight refreshes and profile loads are cancelled first; the backend call
    /// is best-effort and local state is always cleared.
    pub async fn logout(&self) {
        let token = self.core.store().get();
        self.core.end_lifetime();

        if let Err(e) = api::logout(&self.client, &self.config, token.as_deref()).await {
            tracing::warn!(error = %e, "Logout request failed, clearing local session anyway");
        }

        self.core.revoke("logout");
        tracing::info!("Logged out");
    }

    /// Send a request on behalf of the session
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<Response> {
        self.http.request(descriptor).await
    }

    /// Refresh the access token now (shared with any refresh already running)
    pub async fn refresh(&self) -> Result<String> {
        Ok(self.refresher.refresh().await?)
    }

    /// Load the profile again through the session client
    pub async fn reload_profile(&self) -> Result<UserProfile> {
        let lifetime = self.core.lifetime();
        let response = self.request(RequestDescriptor::get("/profile")).await?;
        let user: UserProfile = response
            .json()
            .await
            .context("Failed to parse profile response")?;

        let token = self.core.store().get().ok_or(SessionError::Cancelled)?;
        if self.core.publish_user(&lifetime, &token, user.clone()) {
            Ok(user)
        } else {
            Err(SessionError::Cancelled)
        }
    }

    /// HTTP client bound to this session, for handing to other components
    pub fn http_client(&self) -> Arc<SessionHttpClient> {
        self.http.clone()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.core.snapshot().user
    }

    pub fn is_authenticated(&self) -> bool {
        self.core.snapshot().is_authenticated()
    }

    /// True only while bootstrapping
    pub fn is_loading(&self) -> bool {
        self.core.snapshot().is_loading()
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core.snapshot()
    }

    /// Observe every status/user change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.core.subscribe()
    }

    /// Current access token
    pub fn access_token(&self) -> Option<String> {
        self.core.store().get()
    }

    /// Requests waiting on a token refresh
    pub fn queued_requests(&self) -> usize {
        self.refresher.queued_requests()
    }

    /// Refresh calls issued so far
    pub fn refresh_count(&self) -> u64 {
        self.refresher.flights_started()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }
}

/// Keep the cookie jar in step with the token: saved with it, cleared with it
fn sync_cookies(jar: &CookieJar, token: Option<&str>) {
    let result = match token {
        Some(_) => jar.save(),
        None => jar.clear(),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to sync cookie jar");
    }
}
