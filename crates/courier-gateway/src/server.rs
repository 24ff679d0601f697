//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_relay};
use crate::routes::RouteTable;
use axum::{
    routing::{get, post},
    Router,
};
use courier_core::{CooldownController, RpcRelay};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Application state shared across handlers.
pub struct AppState {
    /// Relay to the backend services.
    pub relay: Arc<RpcRelay>,
    /// Admission gate applied before relay dispatch.
    pub cooldown: Arc<CooldownController>,
    /// Per-action route configuration.
    pub routes: RouteTable,
}

/// Build the gateway router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/:service/:action", post(handle_relay))
        .layer(cors)
        .with_state(state)
}

/// Start the gateway HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("gateway listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Server error");
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_starts() {
        let state = Arc::new(AppState {
            relay: Arc::new(RpcRelay::new()),
            cooldown: Arc::new(CooldownController::new()),
            routes: RouteTable::standard(),
        });
        let addr = start_server(state, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }
}
