use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::storage::{MemoryPersistence, TokenPersistence};
use super::types::StoredToken;
use crate::error::{Result, SessionError};

type Listener = Arc<dyn Fn(Option<&str>) + Send + Sync>;
type ListenerList = Mutex<Vec<(u64, Listener)>>;

/// Holder of the current access token
///
/// Writes go to the persistence backend before listeners are notified, so a
/// restarted process always observes the latest token. Listeners run
/// synchronously on the writing task and must not write to the store.
pub struct TokenStore {
    persistence: Box<dyn TokenPersistence>,
    current: RwLock<Option<StoredToken>>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
    /// Serializes persist + update + notify so listeners see writes in order
    write_lock: Mutex<()>,
}

impl TokenStore {
    /// Create a store over a persistence backend, restoring any saved token
    pub fn new(persistence: impl TokenPersistence + 'static) -> Self {
        let restored = match persistence.load() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable persisted token");
                if let Err(e) = persistence.remove() {
                    tracing::warn!(error = %e, "Failed to remove unreadable token");
                }
                None
            }
        };

        if let Some(ref stored) = restored {
            tracing::debug!(
                saved_at = %stored.saved_at.to_rfc3339(),
                "Restored persisted access token"
            );
        }

        Self {
            persistence: Box::new(persistence),
            current: RwLock::new(restored),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Store without durability
    pub fn in_memory() -> Self {
        Self::new(MemoryPersistence::new())
    }

    /// Current access token
    pub fn get(&self) -> Option<String> {
        self.read_current().map(|stored| stored.access_token)
    }

    /// When the current token was stored
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.read_current().map(|stored| stored.saved_at)
    }

    /// Replace the token; persisted first, then listeners notified
    ///
    /// On a persistence failure the in-memory token is left unchanged.
    pub fn set(&self, access_token: &str) -> Result<()> {
        let _guard = self.lock_writes();
        let stored = StoredToken::new(access_token);

        self.persistence
            .save(&stored)
            .map_err(|e| SessionError::Storage(format!("{:#}", e)))?;

        if let Ok(mut current) = self.current.write() {
            *current = Some(stored);
        }

        self.notify(Some(access_token));
        Ok(())
    }

    /// Forget the token
    ///
    /// The in-memory token is always cleared and listeners notified; a
    /// persistence failure is reported afterwards.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock_writes();
        let persisted = self.persistence.remove();

        if let Ok(mut current) = self.current.write() {
            *current = None;
        }

        self.notify(None);
        persisted.map_err(|e| SessionError::Storage(format!("{:#}", e)))
    }

    /// Register a listener called with the new token after every `set`/`clear`
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn read_current(&self) -> Option<StoredToken> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, token: Option<&str>) {
        // Snapshot outside the lock so a listener can unsubscribe itself
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };

        for listener in listeners {
            listener(token);
        }
    }
}

/// Handle to a registered listener; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    /// Remove the listener now
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut listeners) = listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
