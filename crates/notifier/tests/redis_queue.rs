//! Redis dispatch queue and worker tests.
//!
//! Requires a running Redis server with `REDIS_URL` env var set. Every test works in
//! its own key namespace. Run with:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p mailroom-notifier --test redis_queue -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use mailroom_common::config::BrandConfig;
use mailroom_common::redis_pool::connect_redis;
use mailroom_common::types::{DeliveryStatus, DispatchRequest, EmailKind};
use mailroom_notifier::attempt::Deliverer;
use mailroom_notifier::error::TransportError;
use mailroom_notifier::health::{QueueHealth, RedisQueueHealth};
use mailroom_notifier::policy::RetryPolicy;
use mailroom_notifier::queue::RedisQueue;
use mailroom_notifier::render::TemplateRenderer;
use mailroom_notifier::scheduler::{AsyncScheduler, DispatchJob};
use mailroom_notifier::store::{DeliveryLogStore, MemoryLogStore};
use mailroom_notifier::transport::{OutgoingEmail, Transport};
use mailroom_notifier::validate::validate_request;
use mailroom_notifier::worker::{DispatchWorker, WorkerSettings};

struct CountingTransport {
    succeed: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, _email: &OutgoingEmail) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(())
        } else {
            Err(TransportError::Transport("421 try again later".to_string()))
        }
    }
}

async fn redis() -> ConnectionManager {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    connect_redis(&url).await.unwrap()
}

async fn queue() -> RedisQueue {
    RedisQueue::with_namespace(redis().await, format!("mailroom-test:{}", Uuid::now_v7()))
}

async fn cleanup(queue: &RedisQueue) {
    let mut conn = redis().await;
    let keys = [
        queue.ready_key(),
        queue.inflight_key(),
        queue.delayed_key(),
        queue.heartbeat_key(),
    ];
    conn.del::<_, ()>(&keys[..]).await.unwrap();
}

fn job() -> DispatchJob {
    DispatchJob::new(Uuid::now_v7(), RetryPolicy::default())
}

#[tokio::test]
#[ignore]
async fn test_claim_parks_job_until_ack() {
    let queue = queue().await;
    let pushed = job();
    queue.enqueue(pushed).await.unwrap();
    assert_eq!(queue.ready_len().await.unwrap(), 1);

    let claimed = queue.claim().await.unwrap().unwrap();
    assert_eq!(claimed.job, pushed);
    assert_eq!(queue.ready_len().await.unwrap(), 0);
    assert_eq!(queue.inflight_len().await.unwrap(), 1);

    queue.ack(&claimed).await.unwrap();
    assert_eq!(queue.inflight_len().await.unwrap(), 0);
    assert!(queue.claim().await.unwrap().is_none());

    cleanup(&queue).await;
}

#[tokio::test]
#[ignore]
async fn test_unacked_jobs_are_recovered() {
    let queue = queue().await;
    let first = job();
    let second = job();
    queue.push(&first).await.unwrap();
    queue.push(&second).await.unwrap();

    // Claimed by a worker that died before acknowledging.
    queue.claim().await.unwrap().unwrap();
    queue.claim().await.unwrap().unwrap();
    assert_eq!(queue.inflight_len().await.unwrap(), 2);

    assert_eq!(queue.recover_inflight().await.unwrap(), 2);
    assert_eq!(queue.inflight_len().await.unwrap(), 0);

    // Original order is kept.
    assert_eq!(queue.claim().await.unwrap().unwrap().job, first);
    assert_eq!(queue.claim().await.unwrap().unwrap().job, second);

    cleanup(&queue).await;
}

#[tokio::test]
#[ignore]
async fn test_malformed_job_is_dropped() {
    let queue = queue().await;
    let mut conn = redis().await;
    conn.lpush::<_, _, ()>(queue.ready_key(), "not json").await.unwrap();

    assert!(queue.claim().await.unwrap().is_none());
    assert_eq!(queue.ready_len().await.unwrap(), 0);
    assert_eq!(queue.inflight_len().await.unwrap(), 0);

    cleanup(&queue).await;
}

#[tokio::test]
#[ignore]
async fn test_only_due_jobs_are_promoted() {
    let queue = queue().await;
    let due = job();
    queue.schedule(&due, Duration::ZERO).await.unwrap();
    queue.schedule(&job(), Duration::from_secs(3600)).await.unwrap();

    assert_eq!(queue.promote_due().await.unwrap(), 1);
    assert_eq!(queue.promote_due().await.unwrap(), 0);
    assert_eq!(queue.claim().await.unwrap().unwrap().job, due);
    assert!(queue.claim().await.unwrap().is_none());

    cleanup(&queue).await;
}

#[tokio::test]
#[ignore]
async fn test_entry_lock_is_exclusive() {
    let queue = queue().await;
    let log_id = Uuid::now_v7();

    assert!(queue.try_lock(log_id, Duration::from_secs(30)).await.unwrap());
    assert!(!queue.try_lock(log_id, Duration::from_secs(30)).await.unwrap());
    queue.unlock(log_id).await.unwrap();
    assert!(queue.try_lock(log_id, Duration::from_secs(30)).await.unwrap());
    queue.unlock(log_id).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_health_requires_worker_heartbeat() {
    let queue = queue().await;
    let health = RedisQueueHealth::new(queue.clone());
    let timeout = Duration::from_secs(2);

    assert!(!health.is_reachable(timeout).await);
    queue.heartbeat(Duration::from_secs(30)).await.unwrap();
    assert!(health.is_reachable(timeout).await);

    cleanup(&queue).await;
}

struct WorkerHarness {
    queue: RedisQueue,
    store: Arc<MemoryLogStore>,
    transport: Arc<CountingTransport>,
    worker: DispatchWorker,
}

async fn worker(succeed: bool) -> WorkerHarness {
    let queue = queue().await;
    let store = Arc::new(MemoryLogStore::new());
    let transport = Arc::new(CountingTransport {
        succeed,
        calls: AtomicUsize::new(0),
    });
    let renderer = TemplateRenderer::new(BrandConfig::default()).unwrap();
    let deliverer = Arc::new(Deliverer::new(
        store.clone(),
        Arc::new(renderer),
        transport.clone(),
    ));
    let settings = WorkerSettings {
        concurrency: 1,
        poll_interval: Duration::from_millis(50),
        heartbeat_ttl: Duration::from_secs(30),
    };
    let worker = DispatchWorker::new(queue.clone(), deliverer, settings);
    WorkerHarness {
        queue,
        store,
        transport,
        worker,
    }
}

async fn queued_entry(store: &MemoryLogStore) -> Uuid {
    let mut request = DispatchRequest::new("a@b.com", EmailKind::Otp);
    request.otp = Some("123456".to_string());
    let payload = validate_request(&request).unwrap();
    store.create(&payload).await.unwrap().id
}

#[tokio::test]
#[ignore]
async fn test_worker_tick_delivers_and_acks() {
    let h = worker(true).await;
    let log_id = queued_entry(&h.store).await;
    h.queue
        .enqueue(DispatchJob::new(log_id, RetryPolicy::default()))
        .await
        .unwrap();

    assert!(h.worker.tick().await.unwrap());
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 1);
    let entry = h.store.get(log_id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeliveryStatus::Sent);
    assert_eq!(h.queue.inflight_len().await.unwrap(), 0);

    assert!(!h.worker.tick().await.unwrap());
    cleanup(&h.queue).await;
}

#[tokio::test]
#[ignore]
async fn test_worker_tick_schedules_retry() {
    let h = worker(false).await;
    let log_id = queued_entry(&h.store).await;
    h.queue
        .enqueue(DispatchJob::new(log_id, RetryPolicy::default()))
        .await
        .unwrap();

    assert!(h.worker.tick().await.unwrap());
    let entry = h.store.get(log_id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeliveryStatus::Queued);
    assert_eq!(entry.attempts, 1);

    let mut conn = redis().await;
    let delayed: usize = conn.zcard(h.queue.delayed_key()).await.unwrap();
    assert_eq!(delayed, 1);
    assert_eq!(h.queue.inflight_len().await.unwrap(), 0);
    assert_eq!(h.queue.ready_len().await.unwrap(), 0);

    cleanup(&h.queue).await;
}

#[tokio::test]
#[ignore]
async fn test_worker_skips_failed_entry() {
    let h = worker(true).await;
    let log_id = queued_entry(&h.store).await;
    let mut entry = h.store.get(log_id).await.unwrap().unwrap();
    entry.status = DeliveryStatus::Failed;
    h.store.insert(entry).await;

    h.queue
        .enqueue(DispatchJob::new(log_id, RetryPolicy::default()))
        .await
        .unwrap();
    assert!(h.worker.tick().await.unwrap());

    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
    let entry = h.store.get(log_id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeliveryStatus::Failed);
    assert_eq!(h.queue.inflight_len().await.unwrap(), 0);

    cleanup(&h.queue).await;
}
