//! HTTP handlers for the Parley server.
//!
//! Serves the authenticated WebSocket endpoint plus health and stats probes.

use crate::auth::{bearer_token, AuthError, Authenticator};
use crate::config::Config;
use crate::connection::{self, PumpConfig};
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parley_core::Dispatcher;
use parley_transport::websocket;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// Envelope dispatcher shared by every connection.
    pub dispatcher: Arc<Dispatcher>,
    /// Token verifier.
    pub authenticator: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(
        config: Config,
        dispatcher: Arc<Dispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            dispatcher,
            authenticator,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    if config.metrics.enabled {
        match config.metrics_addr() {
            Ok(addr) => {
                if let Err(e) = metrics::start_metrics_server(addr) {
                    error!("Failed to start metrics server: {}", e);
                }
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Live connection and room counts.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "online_connections": state.dispatcher.registry().connection_count(),
        "active_rooms": state.dispatcher.rooms().room_count(),
    }))
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Access token.
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The token is verified before upgrading; failures get a plain 401.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = query.token.as_deref().filter(|t| !t.is_empty()).or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
    });

    let identity = match token
        .ok_or(AuthError::MissingToken)
        .and_then(|t| state.authenticator.authenticate(t))
    {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "WebSocket upgrade rejected");
            metrics::record_error("auth");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let dispatcher = state.dispatcher.clone();
    let pump_config = PumpConfig::from(&state.config);
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| {
            let (sink, source) = websocket::split(socket);
            connection::serve(dispatcher, identity, sink, source, pump_config)
        })
}
