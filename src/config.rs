use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CourseHub session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL (the client appends /api)
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Path to the SQLite file holding the persisted session token
    #[arg(short = 'd', long, env = "TOKEN_DB_FILE")]
    pub token_db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log in and persist the session token
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Account password (prompted when omitted)
        #[arg(short, long, env = "COURSEHUB_PASSWORD")]
        password: Option<String>,
    },

    /// Log out and forget the persisted token
    Logout,

    /// Restore the session and print the current user
    Whoami,

    /// Issue an authenticated GET request and print the body
    Get {
        /// Path relative to the API root, e.g. /courses
        path: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,

    // Persistence
    pub token_db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration from parsed CLI arguments with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let config = Config {
            api_base_url: args
                .api_base_url
                .clone()
                .or_else(|| std::env::var("API_BASE_URL").ok())
                .map(|s| s.trim_end_matches('/').to_string())
                .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?,

            token_db_file: args
                .token_db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_token_db_file),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Configuration for a given backend with default settings otherwise
    pub fn for_base_url(api_base_url: impl Into<String>) -> Self {
        Config {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            token_db_file: default_token_db_file(),
            http_connect_timeout: 10,
            http_request_timeout: 30,
            log_level: "info".to_string(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.is_empty() {
            anyhow::bail!("API_BASE_URL cannot be empty");
        }

        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "API_BASE_URL must start with http:// or https://: {}",
                self.api_base_url
            );
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }

    /// Full URL of an API endpoint
    pub fn api_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/api/{}", self.api_base_url, path)
    }
}

/// Default location of the token database
fn default_token_db_file() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("coursehub").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("coursehub-session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
