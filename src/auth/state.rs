// Shared session state: token, status/user snapshot and session lifetime

use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::api;
use super::token_store::{Subscription, TokenStore};
use super::types::{SessionSnapshot, SessionStatus, UserProfile};
use crate::config::Config;
use crate::error::{RefreshFailure, Result, SessionError};

/// State shared by the session manager, the HTTP client and the refresh coordinator
///
/// Every flow that can write a token (login, refresh) captures the current
/// lifetime token first and commits through [`SessionCore::commit_token`], which
/// refuses once that lifetime has been cancelled by logout or a failed refresh.
pub(crate) struct SessionCore {
    store: Arc<TokenStore>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    /// Held while checking or ending the lifetime, so commits and revocations do not interleave
    lifetime: Mutex<CancellationToken>,
    _store_subscription: Subscription,
}

impl SessionCore {
    pub fn new(store: Arc<TokenStore>) -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::bootstrapping());
        let snapshot = Arc::new(tx);

        let listener_tx = snapshot.clone();
        let subscription = store.subscribe(move |token| apply_token_change(&listener_tx, token));

        Self {
            store,
            snapshot,
            lifetime: Mutex::new(CancellationToken::new()),
            _store_subscription: subscription,
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Cancellation token of the current session lifetime
    pub fn lifetime(&self) -> CancellationToken {
        self.lock_lifetime().clone()
    }

    /// Store a token obtained under `lifetime`, unless that lifetime has ended
    pub fn commit_token(&self, lifetime: &CancellationToken, token: &str) -> Result<()> {
        let _guard = self.lock_lifetime();
        if lifetime.is_cancelled() {
            tracing::debug!("Discarding token obtained by a session that has ended");
            return Err(SessionError::Cancelled);
        }
        self.store.set(token)
    }

    /// Publish a freshly loaded profile for `token`
    ///
    /// Returns false when the lifetime ended, the token changed meanwhile, or the
    /// session is not in a state that may show a user.
    pub fn publish_user(
        &self,
        lifetime: &CancellationToken,
        token: &str,
        user: UserProfile,
    ) -> bool {
        let _guard = self.lock_lifetime();
        if lifetime.is_cancelled() || self.store.get().as_deref() != Some(token) {
            tracing::debug!("Discarding profile loaded for a superseded token");
            return false;
        }

        self.snapshot.send_if_modified(|snapshot| match snapshot.status {
            SessionStatus::Bootstrapping | SessionStatus::Authenticated => {
                snapshot.status = SessionStatus::Authenticated;
                snapshot.user = Some(user);
                true
            }
            SessionStatus::Unauthenticated | SessionStatus::Refreshing => false,
        })
    }

    /// Enter `Refreshing` and hand out the lifetime the refresh runs under
    ///
    /// Fails fast when there is no session to refresh. The user is hidden until
    /// the profile is loaded for the refreshed token.
    pub fn begin_refresh(&self) -> std::result::Result<CancellationToken, RefreshFailure> {
        let guard = self.lock_lifetime();
        if self.store.get().is_none() {
            return Err(RefreshFailure::NoSession);
        }
        let mut refusal = None;

        self.snapshot.send_if_modified(|snapshot| match snapshot.status {
            SessionStatus::Unauthenticated => {
                refusal = Some(RefreshFailure::NoSession);
                false
            }
            SessionStatus::Authenticated => {
                snapshot.status = SessionStatus::Refreshing;
                snapshot.user = None;
                true
            }
            SessionStatus::Bootstrapping | SessionStatus::Refreshing => false,
        });

        match refusal {
            Some(failure) => Err(failure),
            None => Ok(guard.clone()),
        }
    }

    /// Finish bootstrapping in the given state
    pub fn settle(&self, status: SessionStatus) {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.status != SessionStatus::Bootstrapping {
                return false;
            }
            snapshot.status = status;
            if status != SessionStatus::Authenticated {
                snapshot.user = None;
            }
            true
        });
    }

    /// Cancel everything running under the current lifetime and start a new one
    pub fn end_lifetime(&self) {
        let mut guard = self.lock_lifetime();
        guard.cancel();
        *guard = CancellationToken::new();
    }

    /// Tear the session down: cancel in-flight work, forget token and user
    ///
    /// Status and user flip in one snapshot update through the store listener.
    pub fn revoke(&self, reason: &str) {
        let mut guard = self.lock_lifetime();
        guard.cancel();
        *guard = CancellationToken::new();

        tracing::info!(reason = reason, "Ending session");
        if let Err(e) = self.store.clear() {
            tracing::error!(error = %e, "Failed to remove persisted token");
        }

        // Also settles a session that was still bootstrapping without a token
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.status == SessionStatus::Unauthenticated && snapshot.user.is_none() {
                return false;
            }
            snapshot.status = SessionStatus::Unauthenticated;
            snapshot.user = None;
            true
        });
    }

    /// Fetch the profile for `token` and publish it, abandoning on lifetime end
    pub async fn load_profile(
        &self,
        client: &Client,
        config: &Config,
        lifetime: &CancellationToken,
        token: &str,
    ) -> Result<UserProfile> {
        let user = tokio::select! {
            biased;
            _ = lifetime.cancelled() => return Err(SessionError::Cancelled),
            result = api::fetch_profile(client, config, token) => result?,
        };

        if self.publish_user(lifetime, token, user.clone()) {
            Ok(user)
        } else {
            Err(SessionError::Cancelled)
        }
    }

    fn lock_lifetime(&self) -> MutexGuard<'_, CancellationToken> {
        self.lifetime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Derive status and user from a token change
///
/// A new token invalidates the loaded profile; bootstrapping stays in place
/// until the bootstrap flow settles it.
fn apply_token_change(snapshot: &watch::Sender<SessionSnapshot>, token: Option<&str>) {
    snapshot.send_modify(|snapshot| {
        snapshot.user = None;
        snapshot.status = match (token, snapshot.status) {
            (None, _) => SessionStatus::Unauthenticated,
            (Some(_), SessionStatus::Bootstrapping) => SessionStatus::Bootstrapping,
            (Some(_), _) => SessionStatus::Authenticated,
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserProfile {
        UserProfile {
            id: serde_json::json!(1),
            name: name.to_string(),
            email: "a@b.com".to_string(),
            role: "student".to_string(),
        }
    }

    fn core() -> SessionCore {
        SessionCore::new(Arc::new(TokenStore::in_memory()))
    }

    #[test]
    fn test_starts_bootstrapping() {
        let core = core();
        assert_eq!(core.status(), SessionStatus::Bootstrapping);
        assert!(core.snapshot().is_loading());
    }

    #[test]
    fn test_commit_and_publish() {
        let core = core();
        core.settle(SessionStatus::Unauthenticated);

        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();
        assert_eq!(core.status(), SessionStatus::Authenticated);
        assert!(core.snapshot().user.is_none());

        assert!(core.publish_user(&lifetime, "t1", user("Ada")));
        assert_eq!(core.snapshot().user.unwrap().name, "Ada");
    }

    #[test]
    fn test_publish_rejected_for_stale_token() {
        let core = core();
        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();
        core.commit_token(&lifetime, "t2").unwrap();

        assert!(!core.publish_user(&lifetime, "t1", user("Ada")));
        assert!(core.snapshot().user.is_none());
    }

    #[test]
    fn test_commit_refused_after_revoke() {
        let core = core();
        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();

        core.revoke("logout");
        assert!(lifetime.is_cancelled());

        let err = core.commit_token(&lifetime, "late-token").unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(core.store().get(), None);
        assert_eq!(core.status(), SessionStatus::Unauthenticated);
    }

    #[test]
    fn test_token_change_clears_user() {
        let core = core();
        core.settle(SessionStatus::Unauthenticated);
        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();
        core.publish_user(&lifetime, "t1", user("Ada"));

        core.store().set("t2").unwrap();
        let snapshot = core.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Authenticated);
        assert!(snapshot.user.is_none());
    }

    #[test]
    fn test_begin_refresh_transitions() {
        let core = core();
        core.settle(SessionStatus::Unauthenticated);
        assert_eq!(core.begin_refresh().unwrap_err(), RefreshFailure::NoSession);

        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();
        assert!(core.publish_user(&lifetime, "t1", user("Ada")));

        assert!(core.begin_refresh().is_ok());
        let snapshot = core.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Refreshing);
        assert!(snapshot.is_authenticated());
        assert!(snapshot.user.is_none());

        core.store().set("t2").unwrap();
        assert_eq!(core.status(), SessionStatus::Authenticated);
    }

    #[test]
    fn test_no_user_published_while_refreshing() {
        let core = core();
        core.settle(SessionStatus::Unauthenticated);
        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();
        core.begin_refresh().unwrap();

        assert!(!core.publish_user(&lifetime, "t1", user("Ada")));
        let snapshot = core.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Refreshing);
        assert!(snapshot.user.is_none());
    }

    #[test]
    fn test_refresh_refused_while_bootstrapping_without_token() {
        let core = core();
        assert_eq!(core.status(), SessionStatus::Bootstrapping);

        assert_eq!(core.begin_refresh().unwrap_err(), RefreshFailure::NoSession);
        assert_eq!(core.status(), SessionStatus::Bootstrapping);
    }

    #[test]
    fn test_refresh_allowed_while_bootstrapping() {
        let store = Arc::new(TokenStore::in_memory());
        store.set("persisted").unwrap();
        let core = SessionCore::new(store);

        assert!(core.begin_refresh().is_ok());
        assert_eq!(core.status(), SessionStatus::Bootstrapping);
    }

    #[test]
    fn test_revoke_is_single_update() {
        let core = core();
        core.settle(SessionStatus::Unauthenticated);
        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();
        core.publish_user(&lifetime, "t1", user("Ada"));

        let mut rx = core.subscribe();
        let _ = rx.borrow_and_update();
        core.revoke("refresh failed");

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
        assert!(snapshot.user.is_none());
        assert!(!snapshot.is_authenticated());
    }

    #[test]
    fn test_end_lifetime_cancels_without_clearing() {
        let core = core();
        let lifetime = core.lifetime();
        core.commit_token(&lifetime, "t1").unwrap();

        core.end_lifetime();
        assert!(lifetime.is_cancelled());
        assert!(!core.lifetime().is_cancelled());
        assert_eq!(core.store().get().as_deref(), Some("t1"));
    }
}
