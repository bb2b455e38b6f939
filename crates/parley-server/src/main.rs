//! # Parley Server
//!
//! Realtime chat server: channels, direct messages, presence, typing,
//! reactions and read receipts over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 PARLEY_JWT_SECRET=... parley
//! ```
//!
//! Clients connect to `ws://host:port/ws?token=<jwt>&format=json|msgpack`.

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_server=debug,parley_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);
    if config.auth.jwt_secret == config::DEV_JWT_SECRET {
        warn!("Using the development JWT secret; set PARLEY_JWT_SECRET in production");
    }

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
