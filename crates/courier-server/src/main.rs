//! # Courier
//!
//! Distributed realtime chat delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run the supervisor with one worker per core
//! courier
//!
//! # Run with custom config
//! courier --config /path/to/courier.toml serve
//!
//! # Run a single in-process worker for development
//! courier single
//!
//! # Print a session token for user 1
//! COURIER_JWT_SECRET=dev courier token --user 1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_protocol::RawUserId;
use courier_server::{config::Config, handlers, supervisor, JwtVerifier};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Distributed realtime chat delivery server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker supervisor (default).
    Serve,
    /// Run one worker process.
    Worker {
        #[arg(long)]
        index: usize,
        #[arg(long)]
        port: u16,
    },
    /// Run one worker in this process.
    Single,
    /// Print a signed session token.
    Token {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => supervisor::run(&config, cli.config.as_deref()).await,
        Command::Worker { index, port } => {
            tracing::info!(worker = index, port, "Starting Courier worker");
            handlers::run_worker(config, index, port).await
        }
        Command::Single => {
            tracing::info!("Starting Courier on {}:{}", config.host, config.port);
            let port = config.port;
            handlers::run_worker(config, 0, port).await
        }
        Command::Token { user, ttl_secs } => {
            let secret = config
                .auth
                .secret
                .as_deref()
                .context("auth.secret (or COURIER_JWT_SECRET) must be set to sign tokens")?;
            let raw = match user.parse::<i64>() {
                Ok(n) => RawUserId::from(n),
                Err(_) => RawUserId::from(user),
            };
            let token = JwtVerifier::new(secret.as_bytes())
                .sign(&raw, Duration::from_secs(ttl_secs))?;
            println!("{token}");
            println!("Cookie: user={token}");
            Ok(())
        }
    }
}
