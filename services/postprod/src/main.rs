use anyhow::{Context, Result};
use postprod::api::{start_api_server, AppState};
use postprod::{
    BatchKafkaConsumer, BatchRunner, Collaborators, Config, HttpImageFetcher, PgMetadataStore,
    ProcessToolRunner, S3BlobStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting post-production service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    if u64::from(config.kafka.max_poll_interval_ms) <= config.processing.batch_timeout_secs * 1000 {
        warn!(
            max_poll_interval_ms = config.kafka.max_poll_interval_ms,
            batch_timeout_secs = config.processing.batch_timeout_secs,
            "Kafka poll interval does not cover the batch timeout; the group may rebalance mid-batch"
        );
    }

    // Initialize collaborators
    let metadata_store = PgMetadataStore::new(&config.database)
        .await
        .context("Failed to initialize metadata store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = S3BlobStore::new(&config.s3)
        .await
        .context("Failed to initialize S3 client")?;

    let image_fetcher = HttpImageFetcher::new(config.tools.timeout())
        .context("Failed to initialize HTTP client")?;

    let collaborators = Collaborators {
        blob_store: Arc::new(blob_store),
        metadata_store: Arc::new(metadata_store),
        tool_runner: Arc::new(ProcessToolRunner::new(&config.tools)),
        image_fetcher: Arc::new(image_fetcher),
    };

    let runner = Arc::new(BatchRunner::new(
        &collaborators,
        &config.tools,
        &config.processing,
    ));

    // Create Kafka consumer
    let kafka_consumer = BatchKafkaConsumer::new(&config.kafka, runner.clone())
        .await
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    // Spawn Kafka consumer task
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = kafka_consumer.run(consumer_shutdown).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    // Spawn API server task
    let api_state = AppState { runner };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Post-production service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down post-production service");

    // Let the consumer finish its current batch; the API has nothing to drain
    shutdown.cancel();
    api_handle.abort();
    if let Err(e) = consumer_handle.await {
        warn!(error = %e, "Kafka consumer task ended abnormally");
    }

    info!("Post-production service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
