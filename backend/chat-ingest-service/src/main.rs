use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chat_ingest_service::config::Config;
use chat_ingest_service::db::MIGRATOR;
use chat_ingest_service::dispatcher::kafka::{ensure_topics, spawn_workers};
use chat_ingest_service::dispatcher::{Dispatcher, WorkerSummary};
use chat_ingest_service::logging::init_tracing;
use chat_ingest_service::metrics::{self, IngestMetrics};
use chat_ingest_service::services::{KafkaDeadLetterSink, PersistenceService};
use chat_ingest_service::store::PgMessageStore;
use db_pool::{create_pool, PoolMetrics};
use prometheus::Registry;
use resilience::{with_retry, with_timeout, RetryConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        workers = config.kafka.concurrency,
        max_attempts = config.retry.max_attempts,
        "Starting chat-ingest-service"
    );

    let registry = Registry::new();
    let ingest_metrics =
        IngestMetrics::register(&registry).context("Failed to register ingest metrics")?;
    let pool_metrics =
        PoolMetrics::register(&registry).context("Failed to register pool metrics")?;

    config.database.log_config();
    let connect_retry = RetryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        jitter: true,
    };
    let pool = with_retry(&connect_retry, || {
        create_pool(&config.database, Some(pool_metrics.clone()))
    })
    .await
    .context("Failed to connect to PostgreSQL")?;

    if config.run_migrations {
        MIGRATOR
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations applied");
    }

    if config.kafka.create_topics {
        ensure_topics(&config.kafka)
            .await
            .context("Failed to provision Kafka topics")?;
    }

    let metrics_server =
        metrics::serve(registry.clone(), config.metrics_port).context("Failed to bind metrics")?;
    let metrics_handle = metrics_server.handle();
    let metrics_task = tokio::spawn(metrics_server);
    info!(port = config.metrics_port, "Metrics endpoint listening on /metrics");

    let dead_letters = KafkaDeadLetterSink::new(&config.kafka.dead_letter())
        .context("Failed to create dead-letter producer")?;
    let dispatcher = Arc::new(Dispatcher::new(
        PersistenceService::new(Arc::new(PgMessageStore::new(pool.clone()))),
        Arc::new(dead_letters),
        config.retry.clone(),
        ingest_metrics,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&config.kafka, dispatcher, shutdown_rx)
        .context("Failed to start Kafka workers")?;

    shutdown_signal().await;
    info!(
        grace_secs = config.shutdown_grace.as_secs(),
        "Shutdown signal received, draining workers"
    );
    let _ = shutdown_tx.send(true);

    drain_workers(workers, config.shutdown_grace).await;

    metrics_handle.stop(true).await;
    match metrics_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Metrics server exited with error"),
        Err(e) => warn!(error = %e, "Metrics server task failed"),
    }
    pool.close().await;

    info!("chat-ingest-service stopped");
    Ok(())
}

/// Wait for workers to finish their in-flight record, aborting stragglers
/// once `grace` has elapsed
async fn drain_workers(workers: Vec<JoinHandle<WorkerSummary>>, grace: Duration) {
    let abort_handles: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();

    match with_timeout(grace, futures::future::join_all(workers)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!(error = %e, "Worker task failed");
                }
            }
            info!("All workers stopped");
        }
        Err(e) => {
            warn!(error = %e, "Workers did not stop in time, aborting");
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    }
}
