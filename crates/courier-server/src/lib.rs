//! # Courier Server
//!
//! Worker assembly, HTTP routes and process supervision for Courier. The
//! `courier` binary is a thin CLI over this crate.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod session;
pub mod supervisor;

pub use auth::JwtVerifier;
pub use config::Config;
pub use handlers::{router, run_worker, serve, AppState};
