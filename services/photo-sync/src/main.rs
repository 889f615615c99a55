use anyhow::{Context, Result};
use photo_sync::api::{start_api_server, AppState};
use photo_sync::change_feed::KafkaChangeSource;
use photo_sync::compression::CompressionStage;
use photo_sync::config::Config;
use photo_sync::network::{NetworkConditions, NetworkMonitor, NetworkTier};
use photo_sync::pg_store::PgRecordStore;
use photo_sync::s3_store::S3BlobStore;
use photo_sync::scheduler::UploadQueueScheduler;
use photo_sync::session::{SessionDeps, SessionRegistry};
use photo_sync::storage_client::{RecordStore, StorageClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting photo sync service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let records = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        records
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let records: Arc<dyn RecordStore> = records;

    let blobs = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 blob store")?,
    );

    let shutdown = CancellationToken::new();
    let network = NetworkMonitor::new(NetworkConditions::online(
        NetworkTier::Unknown,
        config.network.device_class,
    ));

    let storage = StorageClient::new(blobs, records.clone(), config.upload.operation_timeout());
    let scheduler = UploadQueueScheduler::new(
        config.upload.clone(),
        CompressionStage::new(config.compression.clone()),
        storage,
        network.subscribe(),
        shutdown.clone(),
    );

    let deps = SessionDeps {
        source: Arc::new(KafkaChangeSource::new(config.kafka.clone())),
        records: records.clone(),
        scheduler: scheduler.clone(),
        network: network.clone(),
        polling: config.polling.clone(),
        reconcile: config.reconcile.clone(),
        handshake_timeout: Duration::from_millis(config.kafka.handshake_timeout_ms),
        fetch_timeout: config.upload.operation_timeout(),
    };
    let sessions = Arc::new(SessionRegistry::new(deps, shutdown.clone()));
    let reaper_handle = tokio::spawn(sessions.clone().run_reaper());

    let watcher_handle = tokio::spawn(scheduler.clone().run_network_watcher());

    let api_state = AppState {
        scheduler: scheduler.clone(),
        sessions: sessions.clone(),
        records,
        network,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let stop = async move { api_shutdown.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, stop).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Photo sync service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down photo sync service");

    shutdown.cancel();
    sessions.stop_all();

    let stats = scheduler.stats().borrow().clone();
    if stats.active > 0 {
        warn!(active = stats.active, "Uploads still in flight at shutdown");
    }

    let drain = async {
        let _ = api_handle.await;
        let _ = watcher_handle.await;
        let _ = reaper_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Shutdown grace period elapsed");
    }

    info!("Photo sync service stopped");

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
