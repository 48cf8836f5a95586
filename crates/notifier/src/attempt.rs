//! Single delivery attempt: the per-entry state machine.
//!
//! ```text
//! queued --(attempt start)--> processing
//! processing --(transport ok)--> sent
//! processing --(transport error, retries left)--> queued   (retry after backoff)
//! processing --(transport error, no retries left)--> failed
//! ```
//!
//! The same function drives the worker pool, the in-process scheduler and the direct
//! path. The attempt number comes from the entry's own counter, so a duplicated job
//! cannot stretch the retry budget. Transport and render failures end up on the log
//! entry; only store errors are returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::DeliveryStatus;

use crate::policy::RetryPolicy;
use crate::render::{Renderer, TemplateContext};
use crate::store::{AttemptRecord, DeliveryLogStore};
use crate::transport::{OutgoingEmail, Transport};

/// What happened to the entry after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Terminal success; the entry is `sent`.
    Delivered,
    /// Failed with retries left; the entry is back to `queued`.
    RetryAfter(Duration),
    /// Terminal failure; the entry is `failed` with this error.
    Failed(String),
    /// Another attempt holds a live claim on the entry. Nothing was sent.
    InFlight,
    /// Entry missing, delivered or `failed`. Nothing was sent.
    Skipped,
}

impl AttemptOutcome {
    /// No follow-up attempt is owed by whoever ran this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptOutcome::RetryAfter(_))
    }
}

/// Renders and sends one log entry, then writes the outcome back.
pub struct Deliverer {
    store: Arc<dyn DeliveryLogStore>,
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn Transport>,
}

impl Deliverer {
    pub fn new(
        store: Arc<dyn DeliveryLogStore>,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            renderer,
            transport,
        }
    }

    pub fn store(&self) -> &Arc<dyn DeliveryLogStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run one attempt for `log_id` if the store lets this caller claim the entry.
    pub async fn attempt(
        &self,
        log_id: Uuid,
        policy: &RetryPolicy,
    ) -> Result<AttemptOutcome, AppError> {
        let Some(entry) = self.store.begin_attempt(log_id).await? else {
            return self.unclaimed(log_id).await;
        };
        let attempt = entry.attempts.max(1) as u32;

        tracing::debug!(
            log_id = %log_id,
            kind = %entry.kind,
            attempt,
            max_attempts = policy.max_attempts(),
            "Delivery attempt started"
        );

        let ctx = TemplateContext::from_entry(&entry);
        let sent = match self.renderer.render(entry.kind, &ctx) {
            Ok(body) => {
                let email = OutgoingEmail {
                    to: entry.recipient.clone(),
                    subject: entry.subject.clone(),
                    html: body.html,
                    text: body.text,
                };
                self.transport.send(&email).await
            }
            Err(e) => Err(e),
        };

        let error = match sent {
            Ok(()) => {
                self.store
                    .record(log_id, &AttemptRecord::Sent { at: Utc::now() })
                    .await?;
                tracing::info!(log_id = %log_id, attempt, "Email sent");
                return Ok(AttemptOutcome::Delivered);
            }
            Err(e) => e.to_string(),
        };

        match policy.delay_for(attempt) {
            Some(delay) => {
                let record = AttemptRecord::RetryScheduled {
                    error: error.clone(),
                };
                self.store.record(log_id, &record).await?;
                tracing::warn!(
                    log_id = %log_id,
                    attempt,
                    retry_in_secs = delay.as_secs_f64(),
                    error = %error,
                    "Delivery failed, retry scheduled"
                );
                Ok(AttemptOutcome::RetryAfter(delay))
            }
            None => {
                let record = AttemptRecord::Failed {
                    error: error.clone(),
                };
                self.store.record(log_id, &record).await?;
                tracing::error!(
                    log_id = %log_id,
                    attempts = attempt,
                    error = %error,
                    "Delivery failed permanently"
                );
                Ok(AttemptOutcome::Failed(error))
            }
        }
    }

    async fn unclaimed(&self, log_id: Uuid) -> Result<AttemptOutcome, AppError> {
        match self.store.get(log_id).await? {
            Some(entry) if entry.status == DeliveryStatus::Processing => {
                tracing::debug!(log_id = %log_id, "Entry claimed by another attempt");
                Ok(AttemptOutcome::InFlight)
            }
            Some(entry) => {
                tracing::debug!(
                    log_id = %log_id,
                    status = %entry.status,
                    "Entry not eligible for an attempt, skipping"
                );
                Ok(AttemptOutcome::Skipped)
            }
            None => {
                tracing::debug!(log_id = %log_id, "Entry missing, skipping attempt");
                Ok(AttemptOutcome::Skipped)
            }
        }
    }
}
