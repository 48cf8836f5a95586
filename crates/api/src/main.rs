//! Mailroom API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use mailroom_common::config::{AppConfig, QueueBackend};
use mailroom_common::db::connect_and_migrate;
use mailroom_common::redis_pool::connect_redis;
use mailroom_notifier::health::{AlwaysReachable, QueueHealth, RedisQueueHealth};
use mailroom_notifier::pipeline::DispatchPipeline;
use mailroom_notifier::policy::RetryPolicy;
use mailroom_notifier::queue::RedisQueue;
use mailroom_notifier::scheduler::{AsyncScheduler, InlineScheduler};
use mailroom_notifier::store::{DeliveryLogStore, PgLogStore};

use mailroom_api::routes::create_router;
use mailroom_api::state::AppState;

/// Send requests are small JSON documents.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("mailroom_api=debug,mailroom_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Mailroom API server...");

    let config = AppConfig::from_env()?;

    let pool = connect_and_migrate(&config.database_url, config.db_max_connections).await?;
    let store: Arc<dyn DeliveryLogStore> = Arc::new(PgLogStore::new(pool));
    let deliverer = mailroom_notifier::smtp_deliverer(&config, store.clone())?;

    let (scheduler, health): (Arc<dyn AsyncScheduler>, Arc<dyn QueueHealth>) =
        match config.queue_backend {
            QueueBackend::Redis => {
                let queue = RedisQueue::new(connect_redis(&config.redis_url).await?);
                (
                    Arc::new(queue.clone()),
                    Arc::new(RedisQueueHealth::new(queue)),
                )
            }
            QueueBackend::Inline => {
                tracing::info!("Using in-process scheduler");
                (
                    Arc::new(InlineScheduler::new(deliverer.clone())),
                    Arc::new(AlwaysReachable),
                )
            }
        };

    let pipeline = DispatchPipeline::new(
        deliverer,
        scheduler,
        health,
        RetryPolicy::from_settings(&config.retry),
        Duration::from_millis(config.queue_health_timeout_ms),
    );

    let state = AppState::new(store, Arc::new(pipeline));

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(%addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
