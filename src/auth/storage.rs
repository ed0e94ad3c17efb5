// Durable token persistence backed by SQLite

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::types::StoredToken;

const ACCESS_TOKEN_KEY: &str = "coursehub:session:access-token";

/// Backend that keeps the access token across process restarts
pub trait TokenPersistence: Send + Sync {
    /// Load the persisted token, if any
    fn load(&self) -> Result<Option<StoredToken>>;

    /// Persist a token, replacing any previous one
    fn save(&self, token: &StoredToken) -> Result<()>;

    /// Remove the persisted token
    fn remove(&self) -> Result<()>;
}

/// Token persistence in an `auth_kv` table of a local SQLite file
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (or create) the token database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create token directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database, nothing survives the process
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Token database lock poisoned"))?;
        f(&conn)
    }
}

impl TokenPersistence for SqlitePersistence {
    fn load(&self) -> Result<Option<StoredToken>> {
        let value: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [ACCESS_TOKEN_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load token from SQLite")
        })?;

        match value {
            Some(json) => {
                let stored = serde_json::from_str(&json)
                    .context("Failed to parse token data from SQLite")?;
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    fn save(&self, token: &StoredToken) -> Result<()> {
        let json = serde_json::to_string(token).context("Failed to serialize token data")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![ACCESS_TOKEN_KEY, json],
            )
            .context("Failed to save token to SQLite")?;
            Ok(())
        })
    }

    fn remove(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM auth_kv WHERE key = ?", [ACCESS_TOKEN_KEY])
                .context("Failed to remove token from SQLite")?;
            Ok(())
        })
    }
}

/// Process-local persistence, used for ephemeral sessions and tests
#[derive(Default)]
pub struct MemoryPersistence {
    token: Mutex<Option<StoredToken>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a token already "on disk"
    pub fn with_token(access_token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(StoredToken::new(access_token))),
        }
    }
}

impl TokenPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<StoredToken>> {
        let token = self
            .token
            .lock()
            .map_err(|_| anyhow::anyhow!("Token lock poisoned"))?;
        Ok(token.clone())
    }

    fn save(&self, token: &StoredToken) -> Result<()> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| anyhow::anyhow!("Token lock poisoned"))?;
        *slot = Some(token.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| anyhow::anyhow!("Token lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}
