//! Queue health check.
//!
//! The check is bounded by a caller-supplied timeout and fails closed: a slow broker,
//! a broker error, or a missing worker heartbeat all read as unreachable.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::queue::RedisQueue;

#[async_trait]
pub trait QueueHealth: Send + Sync {
    /// `true` only if the asynchronous worker pool answered within `timeout`.
    async fn is_reachable(&self, timeout: Duration) -> bool;
}

/// Resolve a health check within `timeout`. Anything but `Ok(true)` in time is `false`.
pub async fn check_within<F, E>(timeout: Duration, check: F) -> bool
where
    F: Future<Output = Result<bool, E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            tracing::warn!("Queue broker reachable but no worker heartbeat");
            false
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Queue health check failed");
            false
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Queue health check timed out"
            );
            false
        }
    }
}

/// Redis broker reachable AND at least one worker heartbeat alive.
pub struct RedisQueueHealth {
    queue: RedisQueue,
}

impl RedisQueueHealth {
    pub fn new(queue: RedisQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl QueueHealth for RedisQueueHealth {
    async fn is_reachable(&self, timeout: Duration) -> bool {
        check_within(timeout, self.queue.workers_alive()).await
    }
}

/// Health of the in-process scheduler: reachable while the process runs.
pub struct AlwaysReachable;

#[async_trait]
impl QueueHealth for AlwaysReachable {
    async fn is_reachable(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Fixed answer, for wiring tests.
pub struct StaticHealth(pub bool);

#[async_trait]
impl QueueHealth for StaticHealth {
    async fn is_reachable(&self, _timeout: Duration) -> bool {
        self.0
    }
}
