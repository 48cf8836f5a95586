//! Worker pool consuming the Redis dispatch queue.
//!
//! Each loop refreshes the heartbeat, promotes due retries, then claims one job. A job
//! whose entry is locked by another loop is pushed back with a short delay so attempts
//! for one entry never overlap. A claimed job is acknowledged only once its follow-up
//! (a delayed retry, or nothing) is stored in Redis; until then it sits in the
//! in-flight list, which the pool drains back to the ready list when it starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use mailroom_common::config::AppConfig;
use mailroom_common::error::AppError;

use crate::attempt::{AttemptOutcome, Deliverer};
use crate::queue::RedisQueue;
use crate::scheduler::DispatchJob;
use crate::store::CLAIM_LEASE;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_ttl: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            heartbeat_ttl: Duration::from_secs(config.worker_heartbeat_ttl_secs),
        }
    }
}

pub struct DispatchWorker {
    queue: RedisQueue,
    deliverer: Arc<Deliverer>,
    settings: WorkerSettings,
}

impl DispatchWorker {
    pub fn new(queue: RedisQueue, deliverer: Arc<Deliverer>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            deliverer,
            settings,
        }
    }

    /// Run `concurrency` loops until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.settings.concurrency,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Dispatch worker pool started"
        );

        if let Err(e) = self.queue.recover_inflight().await {
            tracing::error!(error = %e, "Failed to requeue in-flight dispatch jobs");
        }

        let mut loops = JoinSet::new();
        for worker_id in 0..self.settings.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.run_loop(worker_id, shutdown).await });
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker loop panicked");
            }
        }

        tracing::info!("Dispatch worker pool stopped");
    }

    async fn run_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let idle = match self.tick().await {
                Ok(worked) => !worked,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        tracing::debug!(worker_id, "Worker loop stopped");
    }

    /// One iteration. Returns `true` if a job was taken.
    pub async fn tick(&self) -> Result<bool, AppError> {
        self.queue.heartbeat(self.settings.heartbeat_ttl).await?;
        self.queue.promote_due().await?;

        let Some(claimed) = self.queue.claim().await? else {
            return Ok(false);
        };
        self.process(&claimed.job).await?;
        self.queue.ack(&claimed).await?;
        Ok(true)
    }

    /// Run one attempt and store whatever the job still owes. An `Err` means the
    /// follow-up could not be stored and the job must stay in flight.
    async fn process(&self, job: &DispatchJob) -> Result<(), AppError> {
        if !self.queue.try_lock(job.log_id, CLAIM_LEASE).await? {
            tracing::debug!(log_id = %job.log_id, "Entry locked by another worker, deferring job");
            return self.queue.schedule(job, self.settings.poll_interval).await;
        }

        let follow_up = match self.deliverer.attempt(job.log_id, &job.policy).await {
            Ok(AttemptOutcome::RetryAfter(delay)) => self.queue.schedule(job, delay).await,
            // Check again once a crashed holder's claim has expired.
            Ok(AttemptOutcome::InFlight) => self.queue.schedule(job, CLAIM_LEASE).await,
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(
                    log_id = %job.log_id,
                    error = %e,
                    "Delivery attempt hit a store error, rescheduling"
                );
                self.queue.schedule(job, self.settings.poll_interval).await
            }
        };

        self.queue.unlock(job.log_id).await?;
        follow_up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_clamp_concurrency() {
        let mut config = AppConfig::local();
        config.worker_concurrency = 0;
        let settings = WorkerSettings::from_config(&config);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(
            settings.poll_interval,
            Duration::from_millis(config.worker_poll_interval_ms)
        );
    }
}
