//! Shared HTTP API functionality
//!
//! Every IMEX worker exposes a small HTTP surface so operational tooling
//! can probe it. Currently that is a single `/health` endpoint reporting
//! the module name and version.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

/// Build the health router for a worker.
pub fn health_router(module: &'static str, version: &'static str) -> Router {
    Router::new().route(
        "/health",
        get(move || async move { health_body(module, version) }),
    )
}

fn health_body(module: &str, version: &str) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": module,
        "version": version,
    }))
}

/// Bind and serve the health router until the process exits.
pub async fn serve_health(
    port: u16,
    module: &'static str,
    version: &'static str,
) -> crate::Result<()> {
    let app = health_router(module, version);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!("health endpoint on http://127.0.0.1:{port}/health");
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::Error::Internal(format!("health server: {e}")))
}
