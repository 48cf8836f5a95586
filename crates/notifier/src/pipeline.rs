//! Dispatch pipeline: accepts a notification, logs it, and picks the execution path.
//!
//! Healthy queue: the entry is handed to the `AsyncScheduler` and the caller gets an
//! "accepted" result right away. Unhealthy queue (or a failed enqueue): the pipeline
//! runs a single attempt in the caller's task and returns the terminal status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::{
    DeliveryLogEntry, DispatchOutcome, DispatchPath, DispatchRequest, DispatchResult, EmailKind,
};

use crate::attempt::{AttemptOutcome, Deliverer};
use crate::health::QueueHealth;
use crate::policy::RetryPolicy;
use crate::scheduler::{AsyncScheduler, DispatchJob};
use crate::store::{AttemptRecord, DeliveryLogStore, can_resubmit};
use crate::validate::{EmailPayload, validate_request};

pub const TEST_EMAIL_SUBJECT: &str = "SMTP Test Email";
pub const TEST_EMAIL_MESSAGE: &str =
    "This is a test email confirming that outgoing mail is configured correctly.";

pub struct DispatchPipeline {
    deliverer: Arc<Deliverer>,
    scheduler: Arc<dyn AsyncScheduler>,
    health: Arc<dyn QueueHealth>,
    policy: RetryPolicy,
    health_timeout: Duration,
}

impl DispatchPipeline {
    pub fn new(
        deliverer: Arc<Deliverer>,
        scheduler: Arc<dyn AsyncScheduler>,
        health: Arc<dyn QueueHealth>,
        policy: RetryPolicy,
        health_timeout: Duration,
    ) -> Self {
        Self {
            deliverer,
            scheduler,
            health,
            policy,
            health_timeout,
        }
    }

    fn store(&self) -> &Arc<dyn DeliveryLogStore> {
        self.deliverer.store()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether the asynchronous worker pool currently answers.
    pub async fn queue_reachable(&self) -> bool {
        self.health.is_reachable(self.health_timeout).await
    }

    /// Validate, log and dispatch a notification.
    ///
    /// Only `Validation` and `InvalidState` (resubmitting an entry that is delivered or
    /// held by a live attempt) are request errors; delivery failures come back inside
    /// the `DispatchResult`.
    pub async fn submit(&self, request: DispatchRequest) -> Result<DispatchResult, AppError> {
        let payload = validate_request(&request)?;
        let entry = self.obtain_entry(&payload, request.log_id).await?;

        if self.queue_reachable().await {
            match self
                .scheduler
                .enqueue(DispatchJob::new(entry.id, self.policy))
                .await
            {
                Ok(()) => {
                    tracing::info!(log_id = %entry.id, kind = %entry.kind, "Email queued");
                    return Ok(DispatchResult::accepted(entry.id));
                }
                Err(e) => {
                    tracing::warn!(
                        log_id = %entry.id,
                        error = %e,
                        "Enqueue failed, falling back to direct send"
                    );
                }
            }
        } else {
            tracing::warn!(log_id = %entry.id, "Queue unreachable, sending directly");
        }

        self.send_direct(entry.id).await
    }

    /// Resubmit an existing entry with its stored payload and a fresh retry budget.
    ///
    /// Accepted for `failed`, `pending` and `queued` entries, and for `processing`
    /// entries whose attempt claim has expired.
    pub async fn retry(&self, log_id: Uuid) -> Result<DispatchResult, AppError> {
        let entry = self
            .store()
            .get(log_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Email log {} not found", log_id)))?;

        if !can_resubmit(&entry, Utc::now()) {
            return Err(AppError::InvalidState(format!(
                "Email log {} is {} and cannot be retried",
                log_id, entry.status
            )));
        }

        tracing::info!(log_id = %log_id, status = %entry.status, "Manual retry requested");
        self.submit(entry.to_request()).await
    }

    /// Check the transport connection, then send a `test` email to `recipient` on the direct path.
    pub async fn test_smtp(&self, recipient: &str) -> Result<DispatchResult, AppError> {
        let mut request = DispatchRequest::new(recipient, EmailKind::Test);
        request.subject = Some(TEST_EMAIL_SUBJECT.to_string());
        request.action = Some("smtp_test".to_string());
        request.message = Some(TEST_EMAIL_MESSAGE.to_string());

        let payload = validate_request(&request)?;
        let entry = self.store().create(&payload).await?;

        if let Err(e) = self.deliverer.transport().test_connection().await {
            let error = e.to_string();
            self.store()
                .record(entry.id, &AttemptRecord::Failed { error: error.clone() })
                .await?;
            tracing::error!(log_id = %entry.id, error = %error, "SMTP connection test failed");
            return Ok(DispatchResult::failed(entry.id, error));
        }

        self.send_direct(entry.id).await
    }

    async fn obtain_entry(
        &self,
        payload: &EmailPayload,
        log_id: Option<Uuid>,
    ) -> Result<DeliveryLogEntry, AppError> {
        let Some(id) = log_id else {
            return self.store().create(payload).await;
        };

        if let Some(entry) = self.store().requeue(id, payload).await? {
            return Ok(entry);
        }

        match self.store().get(id).await? {
            Some(existing) => Err(AppError::InvalidState(format!(
                "Email log {} is {} and cannot be resubmitted",
                id, existing.status
            ))),
            None => {
                tracing::debug!(log_id = %id, "Unknown log id on submit, creating a new entry");
                self.store().create(payload).await
            }
        }
    }

    /// One attempt, no retries, terminal status returned to the caller.
    async fn send_direct(&self, log_id: Uuid) -> Result<DispatchResult, AppError> {
        let outcome = self.deliverer.attempt(log_id, &RetryPolicy::no_retry()).await?;

        match outcome {
            AttemptOutcome::Delivered => Ok(DispatchResult::sent(log_id)),
            AttemptOutcome::Failed(error) => Ok(DispatchResult::failed(log_id, error)),
            AttemptOutcome::RetryAfter(_) | AttemptOutcome::InFlight | AttemptOutcome::Skipped => {
                let entry = self
                    .store()
                    .get(log_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Email log {} not found", log_id)))?;
                let outcome = if entry.status.is_delivered() {
                    DispatchOutcome::Success
                } else {
                    DispatchOutcome::Failure
                };
                Ok(DispatchResult {
                    outcome,
                    status: entry.status,
                    log_id,
                    path: DispatchPath::Direct,
                    error: entry.error,
                })
            }
        }
    }
}
