//! Delivery log read routes.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::DeliveryLogEntry;
use mailroom_notifier::store::{DeliveryStats, KindStats, LogFilter};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/email/logs", get(list_logs))
        .route("/api/email/logs/{id}", get(get_log))
        .route("/api/email/stats", get(stats))
        .route("/api/email/stats/types", get(kind_stats))
}

/// GET /api/email/logs — Newest first, filterable by kind, status, recipient and date.
async fn list_logs(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Result<Json<Vec<DeliveryLogEntry>>, AppError> {
    let entries = state.store.list(&filter).await?;
    Ok(Json(entries))
}

async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryLogEntry>, AppError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Email log {} not found", id)))
}

async fn stats(State(state): State<AppState>) -> Result<Json<DeliveryStats>, AppError> {
    Ok(Json(state.store.stats().await?))
}

async fn kind_stats(State(state): State<AppState>) -> Result<Json<Vec<KindStats>>, AppError> {
    Ok(Json(state.store.kind_stats().await?))
}
