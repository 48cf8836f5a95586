use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::{DeliveryLogEntry, DeliveryStatus, EmailKind};

use super::{
    AttemptRecord, DeliveryLogStore, DeliveryStats, KindStats, LogFilter, can_begin_attempt,
    can_resubmit, success_rate,
};
use crate::validate::EmailPayload;

/// In-process delivery log keyed by id. UUID v7 keys keep creation order.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: Mutex<BTreeMap<Uuid, DeliveryLogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Insert or replace an entry as-is.
    pub async fn insert(&self, entry: DeliveryLogEntry) {
        self.entries.lock().await.insert(entry.id, entry);
    }
}

fn apply_payload(entry: &mut DeliveryLogEntry, payload: &EmailPayload) {
    entry.recipient = payload.recipient.clone();
    entry.kind = payload.kind;
    entry.subject = payload.subject.clone();
    entry.action = payload.action.clone();
    entry.message = payload.message.clone();
    entry.otp = payload.otp.clone();
    entry.link = payload.link.clone();
    entry.link_text = payload.link_text.clone();
    entry.extra = payload.extra_json();
}

#[async_trait]
impl DeliveryLogStore for MemoryLogStore {
    async fn create(&self, payload: &EmailPayload) -> Result<DeliveryLogEntry, AppError> {
        let mut entry = DeliveryLogEntry {
            id: Uuid::now_v7(),
            recipient: String::new(),
            kind: EmailKind::General,
            subject: String::new(),
            action: String::new(),
            message: String::new(),
            otp: None,
            link: None,
            link_text: None,
            extra: serde_json::json!({}),
            status: DeliveryStatus::Queued,
            created_at: Utc::now(),
            sent_at: None,
            error: None,
            attempts: 0,
            claimed_at: None,
        };
        apply_payload(&mut entry, payload);

        self.entries.lock().await.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryLogEntry>, AppError> {
        Ok(self.entries.lock().await.get(&id).cloned())
    }

    async fn requeue(
        &self,
        id: Uuid,
        payload: &EmailPayload,
    ) -> Result<Option<DeliveryLogEntry>, AppError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(None);
        };
        if !can_resubmit(entry, Utc::now()) {
            return Ok(None);
        }
        apply_payload(entry, payload);
        entry.status = DeliveryStatus::Queued;
        entry.attempts = 0;
        entry.claimed_at = None;
        Ok(Some(entry.clone()))
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<DeliveryLogEntry>, AppError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) if can_begin_attempt(entry, now) => {
                entry.status = DeliveryStatus::Processing;
                entry.attempts += 1;
                entry.claimed_at = Some(now);
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record(&self, id: Uuid, record: &AttemptRecord) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Email log {} not found", id)))?;
        record.apply_to(entry);
        Ok(())
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<DeliveryLogEntry>, AppError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<DeliveryStats, AppError> {
        let entries = self.entries.lock().await;
        let count = |pred: fn(DeliveryStatus) -> bool| {
            entries.values().filter(|e| pred(e.status)).count() as i64
        };
        Ok(DeliveryStats::from_counts(
            entries.len() as i64,
            count(DeliveryStatus::is_delivered),
            count(|s| s == DeliveryStatus::Failed),
            count(DeliveryStatus::is_outstanding),
        ))
    }

    async fn kind_stats(&self) -> Result<Vec<KindStats>, AppError> {
        let entries = self.entries.lock().await;
        let mut per_kind: BTreeMap<String, (EmailKind, i64, i64)> = BTreeMap::new();
        for entry in entries.values() {
            let slot = per_kind
                .entry(entry.kind.to_string())
                .or_insert((entry.kind, 0, 0));
            slot.1 += 1;
            if entry.status.is_delivered() {
                slot.2 += 1;
            }
        }

        let mut stats: Vec<KindStats> = per_kind
            .into_values()
            .map(|(kind, count, successful)| KindStats {
                email_type: kind,
                count,
                success_rate: success_rate(successful, count),
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::claim_lease;

    fn payload(recipient: &str, kind: EmailKind) -> EmailPayload {
        EmailPayload {
            recipient: recipient.to_string(),
            kind,
            subject: "Subject".to_string(),
            action: "action".to_string(),
            message: "Message".to_string(),
            otp: None,
            link: None,
            link_text: None,
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_starts_queued() {
        let store = MemoryLogStore::new();
        let entry = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();
        assert_eq!(entry.status, DeliveryStatus::Queued);
        assert!(entry.sent_at.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_begin_attempt_refuses_delivered_entries() {
        let store = MemoryLogStore::new();
        let entry = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();

        let claimed = store.begin_attempt(entry.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, DeliveryStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.claimed_at.is_some());

        store
            .record(entry.id, &AttemptRecord::Sent { at: Utc::now() })
            .await
            .unwrap();
        assert!(store.begin_attempt(entry.id).await.unwrap().is_none());
        assert!(store
            .requeue(entry.id, &payload("a@b.com", EmailKind::Otp))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_entry_is_not_claimed_until_requeued() {
        let store = MemoryLogStore::new();
        let entry = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();
        store.begin_attempt(entry.id).await.unwrap().unwrap();
        store
            .record(entry.id, &AttemptRecord::Failed { error: "refused".to_string() })
            .await
            .unwrap();

        assert!(store.begin_attempt(entry.id).await.unwrap().is_none());
        assert_eq!(store.get(entry.id).await.unwrap().unwrap().status, DeliveryStatus::Failed);

        let requeued = store
            .requeue(entry.id, &payload("a@b.com", EmailKind::Otp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.status, DeliveryStatus::Queued);
        assert_eq!(requeued.attempts, 0);
        assert!(store.begin_attempt(entry.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_processing_entry_is_not_requeued() {
        let store = MemoryLogStore::new();
        let entry = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();
        store.begin_attempt(entry.id).await.unwrap().unwrap();

        assert!(store.begin_attempt(entry.id).await.unwrap().is_none());
        assert!(store
            .requeue(entry.id, &payload("evil@b.com", EmailKind::Otp))
            .await
            .unwrap()
            .is_none());
        let current = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(current.recipient, "a@b.com");
        assert_eq!(current.status, DeliveryStatus::Processing);
    }

    #[tokio::test]
    async fn test_abandoned_processing_entry_can_be_reclaimed() {
        let store = MemoryLogStore::new();
        let mut entry = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();
        entry.status = DeliveryStatus::Processing;
        entry.attempts = 2;
        entry.claimed_at = Some(Utc::now() - claim_lease() - chrono::Duration::seconds(1));
        store.insert(entry.clone()).await;

        let claimed = store.begin_attempt(entry.id).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 3);
        assert!(claimed.claimed_at > entry.claimed_at);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filters() {
        let store = MemoryLogStore::new();
        let first = store.create(&payload("alice@b.com", EmailKind::Otp)).await.unwrap();
        let second = store.create(&payload("bob@b.com", EmailKind::General)).await.unwrap();
        let third = store.create(&payload("alice@c.com", EmailKind::Otp)).await.unwrap();

        let all = store.list(&LogFilter::default()).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let filter = LogFilter {
            kind: Some(EmailKind::Otp),
            recipient: Some("ALICE".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        let page = store.list(&filter).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, third.id);
    }

    #[tokio::test]
    async fn test_stats_and_kind_stats() {
        let store = MemoryLogStore::new();
        let sent = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();
        let failed = store.create(&payload("a@b.com", EmailKind::Otp)).await.unwrap();
        store.create(&payload("a@b.com", EmailKind::General)).await.unwrap();

        store
            .record(sent.id, &AttemptRecord::Sent { at: Utc::now() })
            .await
            .unwrap();
        store
            .record(failed.id, &AttemptRecord::Failed { error: "boom".to_string() })
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_emails, 3);
        assert_eq!(stats.successful_emails, 1);
        assert_eq!(stats.failed_emails, 1);
        assert_eq!(stats.pending_emails, 1);
        assert_eq!(stats.success_rate, 33.33);

        let kinds = store.kind_stats().await.unwrap();
        assert_eq!(kinds[0].email_type, EmailKind::Otp);
        assert_eq!(kinds[0].count, 2);
        assert_eq!(kinds[0].success_rate, 50.0);
        assert_eq!(kinds[1].email_type, EmailKind::General);
        assert_eq!(kinds[1].success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_record_unknown_id_is_not_found() {
        let store = MemoryLogStore::new();
        let err = store
            .record(Uuid::now_v7(), &AttemptRecord::Failed { error: "x".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
