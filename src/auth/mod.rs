// Authentication module
// Token persistence, single-flight refresh and the session state machine

mod api;
mod cookies;
mod manager;
mod refresh;
mod state;
mod storage;
mod token_store;
mod types;

pub use cookies::{cookie_file_for, CookieJar};
pub use manager::SessionManager;
pub use refresh::RefreshCoordinator;
pub use storage::{MemoryPersistence, SqlitePersistence, TokenPersistence};
pub use token_store::{Subscription, TokenStore};
pub use types::{LoginRequest, SessionSnapshot, SessionStatus, StoredToken, UserProfile};
