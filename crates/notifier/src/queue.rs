//! Redis-backed dispatch queue.
//!
//! Keys, all under a namespace (`mailroom` by default):
//! - `{ns}:dispatch:ready`: list of serialized jobs, `LPUSH` to add.
//! - `{ns}:dispatch:inflight`: jobs a worker has taken but not finished. `LMOVE` from
//!   the ready list is the claim; the worker removes the job once its follow-up is
//!   stored. Jobs left here by a dead worker go back to the ready list on startup.
//! - `{ns}:dispatch:delayed`: sorted set of jobs scored by ready-at epoch millis.
//!   Due jobs are moved to the ready list; `ZREM` returning 1 is the claim, so two
//!   workers never promote the same job.
//! - `{ns}:dispatch:lock:{log_id}`: `SET NX EX` lock, one attempt in flight per entry.
//! - `{ns}:worker:heartbeat`: refreshed by every worker loop, read by the health check.
//!
//! A recovered job may duplicate one that is still running. That is harmless: the
//! store refuses to claim an entry that is delivered, failed or held by a live attempt.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction};
use uuid::Uuid;

use mailroom_common::error::AppError;

use crate::scheduler::{AsyncScheduler, DispatchJob};

pub const DEFAULT_NAMESPACE: &str = "mailroom";

/// Most delayed jobs promoted per sweep.
const PROMOTE_BATCH: isize = 100;

/// A job taken off the ready list, still parked in the in-flight list.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: DispatchJob,
    raw: String,
}

#[derive(Clone)]
pub struct RedisQueue {
    redis: ConnectionManager,
    namespace: String,
}

impl RedisQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_namespace(redis, DEFAULT_NAMESPACE)
    }

    /// Queue whose keys all live under `namespace`.
    pub fn with_namespace(redis: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            redis,
            namespace: namespace.into(),
        }
    }

    pub fn ready_key(&self) -> String {
        format!("{}:dispatch:ready", self.namespace)
    }

    pub fn inflight_key(&self) -> String {
        format!("{}:dispatch:inflight", self.namespace)
    }

    pub fn delayed_key(&self) -> String {
        format!("{}:dispatch:delayed", self.namespace)
    }

    pub fn heartbeat_key(&self) -> String {
        format!("{}:worker:heartbeat", self.namespace)
    }

    fn lock_key(&self, log_id: Uuid) -> String {
        format!("{}:dispatch:lock:{}", self.namespace, log_id)
    }

    fn encode(job: &DispatchJob) -> Result<String, AppError> {
        serde_json::to_string(job)
            .map_err(|e| AppError::Internal(format!("failed to encode dispatch job: {}", e)))
    }

    /// Make a job immediately available to workers.
    pub async fn push(&self, job: &DispatchJob) -> Result<(), AppError> {
        let payload = Self::encode(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.ready_key(), payload).await?;
        Ok(())
    }

    /// Make a job available after `delay`.
    pub async fn schedule(&self, job: &DispatchJob, delay: Duration) -> Result<(), AppError> {
        let payload = Self::encode(job)?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(self.delayed_key(), payload, ready_at).await?;
        Ok(())
    }

    /// Move due delayed jobs to the ready list. Returns how many this caller moved.
    pub async fn promote_due(&self) -> Result<usize, AppError> {
        let now = Utc::now().timestamp_millis();
        let delayed = self.delayed_key();
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(&delayed, "-inf", now, 0, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for payload in due {
            let claimed: i64 = conn.zrem(&delayed, &payload).await?;
            if claimed == 1 {
                conn.lpush::<_, _, ()>(self.ready_key(), &payload).await?;
                promoted += 1;
            }
        }

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted due retry jobs");
        }
        Ok(promoted)
    }

    /// Take the oldest ready job into the in-flight list.
    ///
    /// Undecodable payloads are dropped with an error log.
    pub async fn claim(&self) -> Result<Option<ClaimedJob>, AppError> {
        let ready = self.ready_key();
        let inflight = self.inflight_key();
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn
            .lmove(&ready, &inflight, Direction::Right, Direction::Left)
            .await?;
        let Some(raw) = payload else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(job) => Ok(Some(ClaimedJob { job, raw })),
            Err(e) => {
                tracing::error!(error = %e, payload = %raw, "Dropping malformed dispatch job");
                conn.lrem::<_, _, ()>(&inflight, 1, &raw).await?;
                Ok(None)
            }
        }
    }

    /// Forget a claimed job once whatever it owes (a retry, nothing) is stored.
    pub async fn ack(&self, claimed: &ClaimedJob) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(self.inflight_key(), 1, &claimed.raw).await?;
        Ok(())
    }

    /// Put every in-flight job back on the ready list. Returns how many moved.
    pub async fn recover_inflight(&self) -> Result<usize, AppError> {
        let inflight = self.inflight_key();
        let ready = self.ready_key();
        let mut conn = self.redis.clone();

        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn
                .lmove(&inflight, &ready, Direction::Right, Direction::Left)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(recovered, "Requeued dispatch jobs left in flight");
        }
        Ok(recovered)
    }

    /// Try to take the per-entry lock. `false` means another worker holds it.
    pub async fn try_lock(&self, log_id: Uuid, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(log_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    pub async fn unlock(&self, log_id: Uuid) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.lock_key(log_id)).await?;
        Ok(())
    }

    /// Mark the worker pool alive for `ttl`.
    pub async fn heartbeat(&self, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(
            self.heartbeat_key(),
            Utc::now().timestamp(),
            ttl.as_secs().max(1),
        )
        .await?;
        Ok(())
    }

    /// Broker answers `PING` and at least one worker heartbeat is alive.
    pub async fn workers_alive(&self) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Ok(false);
        }
        Ok(conn.exists(self.heartbeat_key()).await?)
    }

    /// Length of the ready list.
    pub async fn ready_len(&self) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(self.ready_key()).await?)
    }

    /// Length of the in-flight list.
    pub async fn inflight_len(&self) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(self.inflight_key()).await?)
    }
}

#[async_trait]
impl AsyncScheduler for RedisQueue {
    async fn enqueue(&self, job: DispatchJob) -> Result<(), AppError> {
        self.push(&job).await?;
        tracing::debug!(log_id = %job.log_id, "Dispatch job enqueued");
        Ok(())
    }
}
