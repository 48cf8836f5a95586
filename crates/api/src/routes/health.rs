//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health — service liveness plus the state of the worker queue.
///
/// An unreachable queue degrades the service (sends go out on the direct path) but
/// does not make it unhealthy, so the status code stays 200.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let reachable = state.pipeline.queue_reachable().await;
    Json(json!({
        "status": if reachable { "ok" } else { "degraded" },
        "service": "mailroom-api",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": if reachable { "reachable" } else { "unreachable" },
    }))
}
