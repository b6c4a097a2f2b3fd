//! # Liveness Endpoint
//!
//! Minimal HTTP listener for container health probes. Answers `OK` while the
//! process is up; it does not reflect sync progress.

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

async fn ok() -> &'static str {
    "OK"
}

pub fn health_router() -> Router {
    Router::new()
        .route("/", get(ok))
        .route("/health", get(ok))
        .layer(TraceLayer::new_for_http())
}

/// Serves the liveness router on `addr` until `shutdown` fires.
pub async fn run_health_server(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Health endpoint listening");
    axum::serve(listener, health_router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
