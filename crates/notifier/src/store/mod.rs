//! Delivery log store — the only shared mutable state of the pipeline.
//!
//! Every status change is one atomic update scoped to one entry. The store owns the
//! per-entry guards: `begin_attempt` only claims `queued`/`pending` entries (or a
//! `processing` claim whose lease ran out), so a duplicate or stale job can neither
//! reopen a `sent`/`failed` entry nor run beside a live attempt. The attempt counter
//! lives on the entry, which keeps the retry bound even when jobs are duplicated.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::{DeliveryLogEntry, DeliveryStatus, EmailKind};

use crate::validate::EmailPayload;

pub use memory::MemoryLogStore;
pub use postgres::PgLogStore;

/// Default page size for log listings.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: i64 = 200;

/// How long an attempt may hold an entry in `processing` before the claim counts as
/// abandoned (worker killed mid-attempt) and the entry can be claimed or resubmitted.
pub const CLAIM_LEASE: std::time::Duration = std::time::Duration::from_secs(300);

pub fn claim_lease() -> Duration {
    Duration::seconds(CLAIM_LEASE.as_secs() as i64)
}

/// `processing` with a claim older than the lease.
pub fn claim_is_stale(entry: &DeliveryLogEntry, now: DateTime<Utc>) -> bool {
    entry.status == DeliveryStatus::Processing
        && entry.claimed_at.is_none_or(|at| now - at >= claim_lease())
}

/// Whether a job may start an attempt on this entry.
pub fn can_begin_attempt(entry: &DeliveryLogEntry, now: DateTime<Utc>) -> bool {
    matches!(entry.status, DeliveryStatus::Queued | DeliveryStatus::Pending)
        || claim_is_stale(entry, now)
}

/// Whether a caller may resubmit this entry (manual retry or `submit` with its id).
pub fn can_resubmit(entry: &DeliveryLogEntry, now: DateTime<Utc>) -> bool {
    entry.status.is_retryable() || claim_is_stale(entry, now)
}

/// Outcome of one attempt, written back to the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptRecord {
    /// `sent`, `sent_at` set, `error` cleared.
    Sent { at: DateTime<Utc> },
    /// Back to `queued` with the failure kept until the next attempt.
    RetryScheduled { error: String },
    /// Terminal `failed`.
    Failed { error: String },
}

impl AttemptRecord {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            AttemptRecord::Sent { .. } => DeliveryStatus::Sent,
            AttemptRecord::RetryScheduled { .. } => DeliveryStatus::Queued,
            AttemptRecord::Failed { .. } => DeliveryStatus::Failed,
        }
    }

    /// Apply this record to an in-memory entry.
    pub fn apply_to(&self, entry: &mut DeliveryLogEntry) {
        entry.status = self.status();
        match self {
            AttemptRecord::Sent { at } => {
                entry.sent_at = Some(*at);
                entry.error = None;
            }
            AttemptRecord::RetryScheduled { error } | AttemptRecord::Failed { error } => {
                entry.error = Some(error.clone());
            }
        }
    }
}

/// Query parameters for listing log entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilter {
    pub kind: Option<EmailKind>,
    pub status: Option<DeliveryStatus>,
    /// Case-insensitive substring of the recipient address.
    pub recipient: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl LogFilter {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn matches(&self, entry: &DeliveryLogEntry) -> bool {
        self.kind.is_none_or(|k| entry.kind == k)
            && self.status.is_none_or(|s| entry.status == s)
            && self
                .recipient
                .as_deref()
                .is_none_or(|r| entry.recipient.contains(&r.to_lowercase()))
            && self.from.is_none_or(|from| entry.created_at >= from)
            && self.to.is_none_or(|to| entry.created_at <= to)
    }
}

/// Aggregate delivery counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total_emails: i64,
    pub successful_emails: i64,
    pub failed_emails: i64,
    pub pending_emails: i64,
    /// Percentage of all entries that were delivered, two decimals.
    pub success_rate: f64,
}

impl DeliveryStats {
    pub fn from_counts(total: i64, successful: i64, failed: i64, pending: i64) -> Self {
        Self {
            total_emails: total,
            successful_emails: successful,
            failed_emails: failed,
            pending_emails: pending,
            success_rate: success_rate(successful, total),
        }
    }
}

/// Per-kind volume and success rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub email_type: EmailKind,
    pub count: i64,
    pub success_rate: f64,
}

pub fn success_rate(successful: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (successful as f64 * 10_000.0 / total as f64).round() / 100.0
}

#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    /// Insert a new entry in `queued` status.
    async fn create(&self, payload: &EmailPayload) -> Result<DeliveryLogEntry, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryLogEntry>, AppError>;

    /// Overwrite the payload of a resubmittable entry (see `can_resubmit`), put it back
    /// to `queued` and reset its attempt counter.
    ///
    /// Returns `None` if the entry does not exist or may not be resubmitted.
    async fn requeue(
        &self,
        id: Uuid,
        payload: &EmailPayload,
    ) -> Result<Option<DeliveryLogEntry>, AppError>;

    /// Claim an entry for one attempt: `processing`, `attempts + 1`, `claimed_at = now`.
    ///
    /// Returns `None` if the entry does not exist or `can_begin_attempt` is false.
    async fn begin_attempt(&self, id: Uuid) -> Result<Option<DeliveryLogEntry>, AppError>;

    async fn record(&self, id: Uuid, record: &AttemptRecord) -> Result<(), AppError>;

    /// Newest first, capped at `filter.effective_limit()`.
    async fn list(&self, filter: &LogFilter) -> Result<Vec<DeliveryLogEntry>, AppError>;

    async fn stats(&self) -> Result<DeliveryStats, AppError>;

    async fn kind_stats(&self) -> Result<Vec<KindStats>, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_rounding() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(1, 3), 33.33);
        assert_eq!(success_rate(2, 3), 66.67);
        assert_eq!(success_rate(5, 5), 100.0);
    }

    #[test]
    fn test_limit_is_clamped() {
        let mut filter = LogFilter::default();
        assert_eq!(filter.effective_limit(), DEFAULT_PAGE_SIZE);
        filter.limit = Some(10_000);
        assert_eq!(filter.effective_limit(), MAX_PAGE_SIZE);
        filter.limit = Some(0);
        assert_eq!(filter.effective_limit(), 1);
    }

    fn entry(status: DeliveryStatus) -> DeliveryLogEntry {
        DeliveryLogEntry {
            id: Uuid::now_v7(),
            recipient: "a@b.com".to_string(),
            kind: EmailKind::General,
            subject: "s".to_string(),
            action: "a".to_string(),
            message: "m".to_string(),
            otp: None,
            link: None,
            link_text: None,
            extra: serde_json::json!({}),
            status,
            created_at: Utc::now(),
            sent_at: None,
            error: Some("previous failure".to_string()),
            attempts: 1,
            claimed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_sent_record_clears_error() {
        let mut entry = entry(DeliveryStatus::Processing);
        AttemptRecord::Sent { at: Utc::now() }.apply_to(&mut entry);
        assert_eq!(entry.status, DeliveryStatus::Sent);
        assert!(entry.sent_at.is_some());
        assert!(entry.error.is_none());
    }

    #[test]
    fn test_terminal_entries_cannot_be_claimed() {
        let now = Utc::now();
        assert!(can_begin_attempt(&entry(DeliveryStatus::Queued), now));
        assert!(can_begin_attempt(&entry(DeliveryStatus::Pending), now));
        assert!(!can_begin_attempt(&entry(DeliveryStatus::Failed), now));
        assert!(!can_begin_attempt(&entry(DeliveryStatus::Sent), now));
        assert!(!can_begin_attempt(&entry(DeliveryStatus::Success), now));
        assert!(can_resubmit(&entry(DeliveryStatus::Failed), now));
        assert!(!can_resubmit(&entry(DeliveryStatus::Sent), now));
    }

    #[test]
    fn test_processing_claim_expires_after_lease() {
        let fresh = entry(DeliveryStatus::Processing);
        let now = Utc::now();
        assert!(!can_begin_attempt(&fresh, now));
        assert!(!can_resubmit(&fresh, now));

        let later = now + claim_lease() + Duration::seconds(1);
        assert!(can_begin_attempt(&fresh, later));
        assert!(can_resubmit(&fresh, later));
    }
}
