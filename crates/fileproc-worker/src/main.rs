use anyhow::Context;
use fileproc_core::WorkerConfig;
use fileproc_db::{setup_database, FileRepository};
use fileproc_infra::{cancel_on_shutdown, init_telemetry};
use fileproc_processing::ProcessRunner;
use fileproc_worker::{default_registry, Dispatcher, PgTaskQueue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = WorkerConfig::from_env()?;

    init_telemetry(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    tracing::info!(
        storage_root = %config.storage_root.display(),
        max_workers = config.dispatcher.max_workers,
        max_retry = config.queue.max_retry,
        "Starting fileproc worker"
    );

    let pool = setup_database(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to set up database")?;

    let store = Arc::new(FileRepository::new(pool.clone()));
    let broker = Arc::new(PgTaskQueue::new(pool.clone()));
    let registry = default_registry(store, Arc::new(ProcessRunner::new()), &config)
        .context("Failed to build handler registry")?;

    let dispatcher = Dispatcher::new(broker, registry, config.dispatcher);

    let shutdown = CancellationToken::new();
    let listener = cancel_on_shutdown(shutdown.clone());

    dispatcher.run(shutdown.clone()).await;

    shutdown.cancel();
    listener.await.context("Shutdown listener panicked")?;
    pool.close().await;

    tracing::info!("fileproc worker stopped");
    Ok(())
}
