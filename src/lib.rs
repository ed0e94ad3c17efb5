// CourseHub session client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{SessionManager, SessionSnapshot, SessionStatus, TokenStore, UserProfile};
pub use config::Config;
pub use error::{RefreshFailure, SessionError};
pub use http_client::{RequestDescriptor, SessionHttpClient};
