//! HTTP server for the dashboard API.
//!
//! Serves the JSON routes from `http_api` with permissive CORS so a
//! frontend on another origin can call it during development.

use crate::error::AppError;
use crate::services::aggregation::AggregationService;
use crate::services::http_api::{api_routes, ApiState};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Build the application router.
pub fn router(service: Arc<AggregationService>) -> Router {
    api_routes()
        .layer(CorsLayer::permissive())
        .with_state(ApiState { service })
}

/// Serve `app` on `addr` until `shutdown` fires.
///
/// In-flight requests are allowed to finish before this returns.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::config(format!("Failed to bind to {}: {}", addr, e)))?;

    let local_addr = listener.local_addr()?;
    log::info!("[server] Listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .map_err(|e| AppError::internal(format!("Server error: {}", e)))?;

    log::info!("[server] Server stopped");
    Ok(())
}
