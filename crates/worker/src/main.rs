use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use territorium_core::artifact::{ArtifactStore, LocalArtifactStore};
use territorium_db::store::{JobStore, PgJobStore};
use territorium_worker::broker::{AmqpBroker, Broker};
use territorium_worker::config::{LogFormat, WorkerConfig};
use territorium_worker::consumer::{self, ResultConsumer};
use territorium_worker::ingest::ResultIngestor;
use territorium_worker::metrics::IngestMetrics;
use territorium_worker::retention::RetentionSweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing ---
    init_tracing(config.log_format);
    tracing::info!(
        results_queue = %config.results_queue,
        media_root = %config.media_root.display(),
        "Loaded worker configuration"
    );

    // --- Database ---
    let pool = territorium_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    territorium_db::health_check(&pool)
        .await
        .context("Database health check failed")?;

    territorium_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Stores ---
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(&config.media_root));
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp_url.clone()));
    let metrics = Arc::new(IngestMetrics::default());

    let cancel = CancellationToken::new();

    // --- Retention ---
    let sweeper = RetentionSweeper::new(Arc::clone(&jobs), Arc::clone(&artifacts))
        .with_metrics(Arc::clone(&metrics));
    let retention_handle = tokio::spawn(
        sweeper.run_periodic(config.retention_sweep_interval, cancel.clone()),
    );

    // --- Consumer ---
    let consumer = Arc::new(ResultConsumer::new(
        broker,
        ResultIngestor::new(jobs, artifacts),
        config.consumer_settings(),
        metrics,
    ));
    let mut consumer_handle = tokio::spawn(consumer::supervise(consumer, cancel.clone()));
    tracing::info!("Result consumer and retention job started");

    // --- Run until shutdown or consumer failure ---
    let consumer_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received, stopping");
            cancel.cancel();
            // The consumer finishes the message in hand before returning.
            consumer_handle.await
        }
        result = &mut consumer_handle => {
            cancel.cancel();
            result
        }
    };

    if let Err(e) = retention_handle.await {
        tracing::warn!(error = %e, "Retention task ended abnormally");
    }

    consumer_result
        .context("Consumer supervisor panicked")?
        .context("Result consumer failed")?;

    tracing::info!("Worker shut down cleanly");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "territorium_worker=info,territorium_db=info,lapin=warn".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
