use std::sync::Arc;

use tokio::sync::watch;

use mailroom_common::config::AppConfig;
use mailroom_common::{db, redis_pool};
use mailroom_notifier::queue::RedisQueue;
use mailroom_notifier::store::PgLogStore;
use mailroom_notifier::worker::{DispatchWorker, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailroom_notifier=info,mailroom_worker=info".into()),
        )
        .json()
        .init();

    tracing::info!("Mailroom worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::connect_and_migrate(&config.database_url, config.db_max_connections).await?;
    let redis = redis_pool::connect_redis(&config.redis_url).await?;

    let store = Arc::new(PgLogStore::new(pool));
    let deliverer = mailroom_notifier::smtp_deliverer(&config, store)?;
    let worker = Arc::new(DispatchWorker::new(
        RedisQueue::new(redis),
        deliverer,
        WorkerSettings::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_task = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, finishing in-flight attempts...");
    shutdown_tx.send(true)?;

    if let Err(e) = pool_task.await {
        tracing::error!(error = %e, "Worker pool task failed");
    }

    tracing::info!("Mailroom worker stopped.");
    Ok(())
}
