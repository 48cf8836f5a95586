//! Email dispatch routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::{DispatchRequest, DispatchResult};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/email/send", post(send_email))
        .route("/api/email/retry/{log_id}", post(retry_email))
        .route("/api/email/test-smtp", post(test_smtp))
}

#[derive(Debug, Deserialize)]
pub struct TestSmtpRequest {
    #[serde(alias = "email")]
    pub recipient: String,
}

/// POST /api/email/send — Submit a notification.
async fn send_email(
    State(state): State<AppState>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<Json<DispatchResult>, AppError> {
    let Json(request) = body?;
    let result = state.pipeline.submit(request).await?;
    Ok(Json(result))
}

/// POST /api/email/retry/:log_id — Resubmit a failed, pending or queued entry
/// (or one whose attempt was abandoned mid-flight).
async fn retry_email(
    State(state): State<AppState>,
    Path(log_id): Path<Uuid>,
) -> Result<Json<DispatchResult>, AppError> {
    let result = state.pipeline.retry(log_id).await?;
    Ok(Json(result))
}

/// POST /api/email/test-smtp — Check SMTP connectivity with a test email.
async fn test_smtp(
    State(state): State<AppState>,
    body: Result<Json<TestSmtpRequest>, JsonRejection>,
) -> Result<Json<DispatchResult>, AppError> {
    let Json(request) = body?;
    let result = state.pipeline.test_smtp(&request.recipient).await?;
    Ok(Json(result))
}
