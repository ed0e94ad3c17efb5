// Cookie jar holding the refresh credential, optionally saved next to the token database

use anyhow::{Context, Result};
use cookie_store::CookieStore;
use reqwest_cookie_store::CookieStoreMutex;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};

/// Cookies shared with the HTTP client
///
/// The backend keeps the refresh credential in an HttpOnly cookie, so a
/// restored access token can only be refreshed if the cookie is restored too.
pub struct CookieJar {
    store: Arc<CookieStoreMutex>,
    path: Option<PathBuf>,
}

impl CookieJar {
    /// Jar backed by a JSON file; an unreadable file starts an empty jar
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = match load_store(&path) {
            Ok(Some(store)) => {
                tracing::debug!("Restored cookies from {}", path.display());
                store
            }
            Ok(None) => CookieStore::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable cookie file");
                CookieStore::default()
            }
        };

        Self {
            store: Arc::new(CookieStoreMutex::new(store)),
            path: Some(path),
        }
    }

    /// Jar that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(CookieStoreMutex::new(CookieStore::default())),
            path: None,
        }
    }

    /// Cookie provider to install on the reqwest client
    pub fn provider(&self) -> Arc<CookieStoreMutex> {
        self.store.clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the current cookies to disk
    ///
    /// Session cookies are included: the refresh cookie usually carries no expiry.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cookie directory: {}", parent.display())
                })?;
            }
        }

        let file = File::create(path)
            .with_context(|| format!("Failed to create cookie file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let store = self.lock();
        cookie_store::serde::json::save_incl_expired_and_nonpersistent(&store, &mut writer)
            .map_err(|e| anyhow::anyhow!("Failed to write cookie file: {}", e))
    }

    /// Forget every cookie and remove the file
    pub fn clear(&self) -> Result<()> {
        self.lock().clear();

        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to remove cookie file: {}", path.display())
                    })
                }
            }
        }
        Ok(())
    }

    /// Number of cookies currently held
    pub fn len(&self) -> usize {
        self.lock().iter_any().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CookieStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_store(path: &Path) -> Result<Option<CookieStore>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to open cookie file: {}", path.display()))
        }
    };

    cookie_store::serde::json::load_all(BufReader::new(file))
        .map(Some)
        .map_err(|e| anyhow::anyhow!("Failed to parse cookie file: {}", e))
}

/// Cookie file kept beside the token database
pub fn cookie_file_for(token_db_file: &Path) -> PathBuf {
    token_db_file.with_extension("cookies.json")
}
