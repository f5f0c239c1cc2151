//! # Plenum Worker
//!
//! Long-running queue consumer: loads configuration from the environment,
//! wires the pgmq transport, the Postgres record store, the filesystem blob
//! store, and the protected generation client, then polls until SIGTERM or
//! Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;
use tracing::info;

use plenum_core::config::PipelineConfig;
use plenum_core::generation::{HttpGenerator, ProtectedGenerator};
use plenum_core::logging::init_structured_logging;
use plenum_core::messaging::PgmqQueue;
use plenum_core::resilience::{CircuitBreaker, TokenBucket};
use plenum_core::storage::{FsBlobStore, PgTableStore, RecordWriter};
use plenum_core::worker::{MapExecutor, ReduceExecutor, TaskProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    init_structured_logging();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let database_url = config
        .queue
        .database_url
        .clone()
        .context("DATABASE_URL or PLENUM__QUEUE__DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;

    let queue = PgmqQueue::new(pool.clone(), &config.queue.name, config.queue.max_delay_secs);
    queue.ensure_queue().await.context("creating queue")?;

    let table = PgTableStore::new(pool, &config.storage.table_name, config.storage.max_batch);
    table.ensure_schema().await.context("creating record table")?;

    let blobs = Arc::new(FsBlobStore::new(&config.storage.blob_root));
    let writer = Arc::new(RecordWriter::new(
        Arc::new(table),
        Duration::from_millis(config.storage.batch_retry_pause_ms),
    ));

    let generator = Arc::new(ProtectedGenerator::new(
        Arc::new(HttpGenerator::new(
            &config.generation.endpoint_url,
            config.generation.api_key.clone(),
        )?),
        Arc::new(TokenBucket::new(
            config.rate_limit.tokens_per_second,
            config.rate_limit.burst_capacity,
        )),
        CircuitBreaker::new("generation", config.circuit_breaker.clone()),
        config.call_timeout(),
    ));

    let processor = TaskProcessor::new(
        &config,
        Arc::new(queue),
        MapExecutor::new(blobs.clone(), generator.clone()),
        ReduceExecutor::new(blobs, generator, writer),
    );

    info!(queue = %config.queue.name, "plenum worker starting");
    tokio::select! {
        result = processor.run() => {
            result.context("processor loop exited")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping worker");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
