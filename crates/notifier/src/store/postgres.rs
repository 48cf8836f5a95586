use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use mailroom_common::error::AppError;
use mailroom_common::types::{DeliveryLogEntry, DeliveryStatus, EmailKind};

use super::{
    AttemptRecord, DeliveryLogStore, DeliveryStats, KindStats, LogFilter, claim_lease,
    success_rate,
};
use crate::validate::EmailPayload;

/// PostgreSQL-backed delivery log (`email_logs` table).
#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLogStore for PgLogStore {
    async fn create(&self, payload: &EmailPayload) -> Result<DeliveryLogEntry, AppError> {
        let entry: DeliveryLogEntry = sqlx::query_as(
            r#"
            INSERT INTO email_logs
                (id, recipient, kind, subject, action, message, otp, link, link_text, extra,
                 status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&payload.recipient)
        .bind(payload.kind.to_string())
        .bind(&payload.subject)
        .bind(&payload.action)
        .bind(&payload.message)
        .bind(&payload.otp)
        .bind(&payload.link)
        .bind(&payload.link_text)
        .bind(payload.extra_json())
        .bind(DeliveryStatus::Queued.to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(log_id = %entry.id, kind = %entry.kind, "Delivery log entry created");
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryLogEntry>, AppError> {
        let entry = sqlx::query_as("SELECT * FROM email_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn requeue(
        &self,
        id: Uuid,
        payload: &EmailPayload,
    ) -> Result<Option<DeliveryLogEntry>, AppError> {
        let entry = sqlx::query_as(
            r#"
            UPDATE email_logs
            SET recipient = $2, kind = $3, subject = $4, action = $5, message = $6,
                otp = $7, link = $8, link_text = $9, extra = $10, status = 'queued',
                attempts = 0, claimed_at = NULL
            WHERE id = $1
              AND (status IN ('failed', 'pending', 'queued')
                   OR (status = 'processing' AND (claimed_at IS NULL OR claimed_at <= $11)))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&payload.recipient)
        .bind(payload.kind.to_string())
        .bind(&payload.subject)
        .bind(&payload.action)
        .bind(&payload.message)
        .bind(&payload.otp)
        .bind(&payload.link)
        .bind(&payload.link_text)
        .bind(payload.extra_json())
        .bind(Utc::now() - claim_lease())
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<DeliveryLogEntry>, AppError> {
        let now = Utc::now();
        let entry = sqlx::query_as(
            r#"
            UPDATE email_logs
            SET status = 'processing', attempts = attempts + 1, claimed_at = $2
            WHERE id = $1
              AND (status IN ('queued', 'pending')
                   OR (status = 'processing' AND (claimed_at IS NULL OR claimed_at <= $3)))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now - claim_lease())
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn record(&self, id: Uuid, record: &AttemptRecord) -> Result<(), AppError> {
        let query = match record {
            AttemptRecord::Sent { at } => {
                sqlx::query(
                    "UPDATE email_logs SET status = $2, sent_at = $3, error = NULL WHERE id = $1",
                )
                .bind(id)
                .bind(record.status().to_string())
                .bind(*at)
            }
            AttemptRecord::RetryScheduled { error } | AttemptRecord::Failed { error } => {
                sqlx::query("UPDATE email_logs SET status = $2, error = $3 WHERE id = $1")
                    .bind(id)
                    .bind(record.status().to_string())
                    .bind(error.clone())
            }
        };

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Email log {} not found", id)));
        }
        Ok(())
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<DeliveryLogEntry>, AppError> {
        let entries = sqlx::query_as(
            r#"
            SELECT * FROM email_logs
            WHERE ($1::text IS NULL OR kind = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR position(lower($3) in recipient) > 0)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#,
        )
        .bind(filter.kind.map(|k| k.to_string()))
        .bind(filter.status.map(|s| s.to_string()))
        .bind(&filter.recipient)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn stats(&self) -> Result<DeliveryStats, AppError> {
        let (total, successful, failed, pending): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status IN ('sent', 'success')),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status IN ('queued', 'processing', 'pending'))
            FROM email_logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DeliveryStats::from_counts(total, successful, failed, pending))
    }

    async fn kind_stats(&self) -> Result<Vec<KindStats>, AppError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                kind,
                COUNT(*),
                COUNT(*) FILTER (WHERE status IN ('sent', 'success'))
            FROM email_logs
            GROUP BY kind
            ORDER BY COUNT(*) DESC, kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, count, successful)| {
                let email_type: EmailKind = kind.parse().map_err(AppError::Internal)?;
                Ok(KindStats {
                    email_type,
                    count,
                    success_rate: success_rate(successful, count),
                })
            })
            .collect()
    }
}
