//! HTTP API server.
//!
//! Read-only pool status for operators and the CLI, plus the endpoint the
//! treasury posts matured coinbase rewards to. Built on Axum; every route
//! lives under `/api/v1`.

pub mod v1;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::tracing::prelude::*;

pub use v1::AppState;

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", v1::routes(state))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on a bound listener until shutdown.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "API server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    debug!("API server stopped");
    Ok(())
}
