//! # Parley Server
//!
//! Real-time chat delivery and call-signaling server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (a JWT secret is required)
//! PARLEY_JWT_SECRET=change-me parley
//!
//! # Run with a config file in the working directory
//! parley    # reads ./parley.toml if present
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 PARLEY_JWT_SECRET=change-me parley
//! ```

use anyhow::{Context, Result};
use parley_core::{Dispatcher, LogNotifier, MemoryStore};
use parley_server::{config::Config, handlers, metrics, AppState, JwtAuthenticator};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    let authenticator = JwtAuthenticator::new(&config.auth.jwt_secret)
        .context("Set auth.jwt_secret or PARLEY_JWT_SECRET")?;
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(Dispatcher::with_notifier(store, Arc::new(LogNotifier)));

    let state = Arc::new(AppState::new(config, dispatcher, Arc::new(authenticator)));
    handlers::run_server(state).await?;

    Ok(())
}
