use anyhow::{Context, Result};
use clap::Parser;

use coursehub_session::config::{CliArgs, Command, Config};
use coursehub_session::{RequestDescriptor, SessionManager, SessionStatus};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();

    // Load configuration first (for log level)
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Backend: {}", config.api_base_url);

    let session = SessionManager::new(config)?;
    let status = session.bootstrap().await;
    tracing::debug!(status = ?status, "Session bootstrapped");

    match args.command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => dialoguer::Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            session.login(&email, &password).await?;
            if let Some(user) = session.current_user() {
                println!("✅ Logged in as {} <{}> ({})", user.name, user.email, user.role);
            }
        }

        Command::Logout => {
            if status == SessionStatus::Unauthenticated {
                println!("Not logged in");
            }
            session.logout().await;
            println!("👋 Logged out");
        }

        Command::Whoami => match session.current_user() {
            Some(user) => {
                println!("{}", serde_json::to_string_pretty(&user)?);
            }
            None if session.is_authenticated() => {
                println!("Logged in (profile unavailable, backend unreachable)");
            }
            None => {
                println!("Not logged in");
                std::process::exit(1);
            }
        },

        Command::Get { path } => {
            let response = session.request(RequestDescriptor::get(path)).await?;
            let body = response.text().await.context("Failed to read response body")?;

            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", body),
            }
        }
    }

    Ok(())
}
