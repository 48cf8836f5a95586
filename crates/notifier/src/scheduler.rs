//! Asynchronous execution of delivery attempts.
//!
//! An `AsyncScheduler` accepts a `DispatchJob` and guarantees it is eventually
//! attempted, re-running it after each backoff delay until the attempt is terminal.
//! The job only names the entry; which attempt it is comes from the entry itself.
//! Two implementations exist: the Redis queue consumed by `mailroom-worker`
//! (`crate::queue::RedisQueue`) and `InlineScheduler`, which runs jobs on the
//! current tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use mailroom_common::error::AppError;

use crate::attempt::{AttemptOutcome, Deliverer};
use crate::policy::RetryPolicy;
use crate::store::CLAIM_LEASE;

/// Store errors tolerated by one inline job before it is left to a manual retry.
const MAX_STORE_ERRORS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pending delivery of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub log_id: Uuid,
    pub policy: RetryPolicy,
}

impl DispatchJob {
    pub fn new(log_id: Uuid, policy: RetryPolicy) -> Self {
        Self { log_id, policy }
    }
}

#[async_trait]
pub trait AsyncScheduler: Send + Sync {
    /// Accept a job for out-of-band execution. Returns once the job is accepted.
    async fn enqueue(&self, job: DispatchJob) -> Result<(), AppError>;
}

/// Runs jobs as tokio tasks in the current process, sleeping through backoff delays.
///
/// At most one task runs per log entry. A job enqueued while its entry already has a
/// task is parked and run by that task once the current job is terminal.
pub struct InlineScheduler {
    deliverer: Arc<Deliverer>,
    in_flight: Arc<Mutex<HashMap<Uuid, Option<DispatchJob>>>>,
}

impl InlineScheduler {
    pub fn new(deliverer: Arc<Deliverer>) -> Self {
        Self {
            deliverer,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn run_job(deliverer: &Deliverer, job: DispatchJob) {
        let mut store_errors = 0;
        loop {
            match deliverer.attempt(job.log_id, &job.policy).await {
                Ok(AttemptOutcome::RetryAfter(delay)) => tokio::time::sleep(delay).await,
                // Our own interrupted attempt may still hold the claim.
                Ok(AttemptOutcome::InFlight) if store_errors > 0 => {
                    tokio::time::sleep(CLAIM_LEASE).await
                }
                Ok(_) => return,
                Err(e) if store_errors < MAX_STORE_ERRORS => {
                    store_errors += 1;
                    tracing::warn!(
                        log_id = %job.log_id,
                        error = %e,
                        store_errors,
                        "Inline delivery attempt hit a store error, trying again"
                    );
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        log_id = %job.log_id,
                        error = %e,
                        "Inline delivery abandoned after repeated store errors"
                    );
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl AsyncScheduler for InlineScheduler {
    async fn enqueue(&self, job: DispatchJob) -> Result<(), AppError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(parked) = in_flight.get_mut(&job.log_id) {
                tracing::debug!(
                    log_id = %job.log_id,
                    "Entry already scheduled in-process, parking job"
                );
                *parked = Some(job);
                return Ok(());
            }
            in_flight.insert(job.log_id, None);
        }

        let deliverer = self.deliverer.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let log_id = job.log_id;
            let mut current = job;
            loop {
                Self::run_job(&deliverer, current).await;

                let mut guard = in_flight.lock().await;
                match guard.get_mut(&log_id).and_then(Option::take) {
                    Some(parked) => current = parked,
                    None => {
                        guard.remove(&log_id);
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_serializes_policy() {
        let policy = RetryPolicy::new(2, Duration::from_secs(5), 3);
        let job = DispatchJob::new(Uuid::now_v7(), policy);
        let raw = serde_json::to_string(&job).unwrap();
        let back: DispatchJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, job);
    }
}
