// Single-flight token refresh with ordered release of waiting requests

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Request, Response};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::api;
use super::state::SessionCore;
use super::types::SessionStatus;
use crate::config::Config;
use crate::error::{RefreshFailure, Result, SessionError};
use crate::http_client::{send, with_bearer};

type RefreshOutcome = std::result::Result<String, RefreshFailure>;
type Flight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// A request that met a 401 and waits for the refresh to finish
///
/// The request itself stays with its caller, which resends it once the
/// refreshed token arrives.
struct PendingRequest {
    respond_to: oneshot::Sender<RefreshOutcome>,
}

#[derive(Default)]
struct FlightState {
    in_flight: Option<Flight>,
    pending: VecDeque<PendingRequest>,
    flights_started: u64,
}

/// Ensures at most one refresh call is in flight; every caller shares its outcome
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    client: Client,
    config: Arc<Config>,
    core: Arc<SessionCore>,
    state: Mutex<FlightState>,
}

impl RefreshCoordinator {
    pub(crate) fn new(client: Client, config: Arc<Config>, core: Arc<SessionCore>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                client,
                config,
                core,
                state: Mutex::new(FlightState::default()),
            }),
        }
    }

    /// Refresh the access token, joining the in-flight refresh if there is one
    ///
    /// Fails fast without a network call when no session exists.
    pub async fn refresh(&self) -> std::result::Result<String, RefreshFailure> {
        let flight = {
            let mut state = self.inner.lock_state();
            self.inner.start_or_join(&mut state)?
        };
        flight.await
    }

    /// Park a request until the refresh completes, then resend it once with the new token
    ///
    /// Parked requests are released in the order they were parked, without
    /// waiting on each other. If the refresh fails the request resolves with its
    /// original 401.
    pub(crate) async fn retry_after_refresh(
        &self,
        request: Request,
        original: SessionError,
    ) -> Result<Response> {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.lock_state();
            if let Err(failure) = self.inner.start_or_join(&mut state) {
                tracing::debug!(reason = %failure, "Refresh not possible, surfacing 401");
                return Err(original);
            }
            state.pending.push_back(PendingRequest { respond_to: tx });
        }

        match rx.await {
            Ok(Ok(token)) => replay(&self.inner.client, request, &token).await,
            Ok(Err(failure)) => {
                tracing::debug!(reason = %failure, "Refresh failed, surfacing original 401");
                Err(original)
            }
            Err(_) => Err(SessionError::Cancelled),
        }
    }

    /// Number of requests parked behind the current refresh
    pub fn queued_requests(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Whether a refresh is currently running
    pub fn is_refreshing(&self) -> bool {
        self.inner
            .lock_state()
            .in_flight
            .as_ref()
            .map_or(false, |flight| flight.peek().is_none())
    }

    /// Number of refresh calls started since creation
    pub fn flights_started(&self) -> u64 {
        self.inner.lock_state().flights_started
    }
}

impl CoordinatorInner {
    fn lock_state(&self) -> MutexGuard<'_, FlightState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the running flight, or start one
    fn start_or_join(
        self: &Arc<Self>,
        state: &mut FlightState,
    ) -> std::result::Result<Flight, RefreshFailure> {
        if let Some(flight) = &state.in_flight {
            // A flight that already resolved but was never cleared (its task died)
            if flight.peek().is_none() {
                tracing::debug!("Joining in-flight token refresh");
                return Ok(flight.clone());
            }
        }

        let lifetime = self.core.begin_refresh()?;
        state.flights_started += 1;

        let task = tokio::spawn(self.clone().run_flight(lifetime));
        let flight = async move {
            task.await
                .unwrap_or_else(|e| Err(RefreshFailure::Aborted(e.to_string())))
        }
        .boxed()
        .shared();

        state.in_flight = Some(flight.clone());
        Ok(flight)
    }

    /// Body of one refresh flight, run on its own task
    async fn run_flight(self: Arc<Self>, lifetime: CancellationToken) -> RefreshOutcome {
        let outcome = tokio::select! {
            biased;
            _ = lifetime.cancelled() => Err(RefreshFailure::Cancelled),
            result = api::refresh_token(&self.client, &self.config) => result,
        };

        let outcome = outcome.and_then(|token| match self.core.commit_token(&lifetime, &token) {
            Ok(()) => Ok(token),
            Err(SessionError::Cancelled) => Err(RefreshFailure::Cancelled),
            Err(e) => Err(RefreshFailure::Storage(e.to_string())),
        });

        // Revoke before waiters wake so they observe the logged-out state
        match &outcome {
            Err(RefreshFailure::Cancelled) => {
                tracing::info!("Token refresh abandoned, session already ended");
            }
            Err(failure) => {
                tracing::error!(error = %failure, "Token refresh failed, ending session");
                self.core.revoke("token refresh failed");
            }
            Ok(_) => {}
        }

        let pending = {
            let mut state = self.lock_state();
            state.in_flight = None;
            std::mem::take(&mut state.pending)
        };

        if outcome.is_ok() && !pending.is_empty() {
            tracing::info!(count = pending.len(), "Releasing requests with refreshed token");
        }
        for parked in pending {
            let _ = parked.respond_to.send(outcome.clone());
        }

        match &outcome {
            Ok(token) => {
                if self.core.status() != SessionStatus::Bootstrapping {
                    self.spawn_profile_reload(lifetime, token.clone());
                }
            }
            Err(failure) => {
                if *failure != RefreshFailure::Cancelled {
                    self.spawn_backend_logout();
                }
            }
        }

        outcome
    }

    /// The token changed, so the profile is loaded again for it
    fn spawn_profile_reload(self: &Arc<Self>, lifetime: CancellationToken, token: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner
                .core
                .load_profile(&inner.client, &inner.config, &lifetime, &token)
                .await
            {
                Ok(_) | Err(SessionError::Cancelled) => {}
                Err(e) if e.is_auth_failure() => {
                    tracing::error!(error = %e, "Refreshed token rejected by profile endpoint");
                    inner.core.revoke("refreshed token rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to reload profile after refresh");
                }
            }
        });
    }

    /// Best-effort server-side logout after a forced local logout
    fn spawn_backend_logout(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = api::logout(&inner.client, &inner.config, None).await {
                tracing::debug!(error = %e, "Backend logout after failed refresh did not succeed");
            }
        });
    }
}

/// Resend a parked request once; a second 401 is returned, not retried
async fn replay(client: &Client, mut request: Request, token: &str) -> Result<Response> {
    with_bearer(&mut request, token)?;
    let result = send(client, request).await;
    if let Err(ref e) = result {
        tracing::warn!(error = %e, "Replayed request failed");
    }
    result
}
