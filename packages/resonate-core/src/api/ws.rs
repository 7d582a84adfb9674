//! WebSocket upgrade handler for the client-initiated flow.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use thiserror::Error;

use crate::endpoint::transport;
use crate::server::ResonateServer;

/// Errors starting the listen socket.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Builds the router exposing the WebSocket upgrade at `path`.
pub fn router(server: Arc<ResonateServer>, path: &str) -> Router {
    Router::new().route(path, get(ws_upgrade)).with_state(server)
}

async fn ws_upgrade(
    State(server): State<Arc<ResonateServer>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, source) = transport::from_axum(socket);
        // The endpoint owns its reader and writer tasks from here on.
        let _endpoint = server.accept(sink, source);
    })
}

/// Binds `addr` and serves the upgrade route until the task is dropped.
pub async fn serve(
    addr: SocketAddr,
    server: Arc<ResonateServer>,
    path: &str,
) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    log::info!("[API] Listening on ws://{}{}", addr, path);
    axum::serve(listener, router(server, path))
        .await
        .map_err(ServeError::Serve)
}
