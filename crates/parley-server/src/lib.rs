//! # parley-server
//!
//! The network shell around `parley-core`: configuration, token
//! authentication, the per-connection pumps, metrics and the axum routes.

pub mod auth;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthError, Authenticator, Claims, JwtAuthenticator};
pub use config::Config;
pub use connection::{serve, PumpConfig, Shutdown};
pub use handlers::{app, run_server, AppState};
