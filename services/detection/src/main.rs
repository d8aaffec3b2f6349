use anyhow::{Context, Result};
use detection_service::config::{Config, ServiceConfig};
use detection_service::detection_engine::InferenceParams;
use detection_service::{
    start_api_server, AppState, DetectionEngineClient, DispatchCoordinator, FrameStore,
    IndexAllocator, MemoryFrameStore, OutboundForwarder, PgFrameStore, RemoteDetector, SizeGuard,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::load().context("Failed to load configuration")?);

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        model = %config.inference.model_name,
        "Starting Nier Detection Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = init_store(&config).await?;

    let detector = RemoteDetector::new(&config.inference)
        .context("Failed to initialize inference backend client")?;
    let engine = DetectionEngineClient::spawn(
        Arc::new(detector),
        InferenceParams::from(&config.inference),
        config.inference.queue_depth,
    );

    let forwarder = OutboundForwarder::new(&config.forwarding)
        .context("Failed to initialize outbound forwarder")?;
    if forwarder.is_enabled() {
        info!("Outbound forwarding enabled");
    }

    let coordinator = DispatchCoordinator::new(
        engine,
        Arc::new(IndexAllocator::new(&config.naming.instance_prefix)),
        SizeGuard::new(config.upload.max_upload_mb),
        Arc::new(forwarder),
        store,
        config.dispatch.max_workers,
        config.persistence.enabled,
    );

    // Create API state
    let api_state = AppState {
        coordinator,
        config: config.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Detection service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down detection service");

    api_handle.abort();

    info!("Detection service stopped");

    Ok(())
}

/// PostgreSQL when a URL is configured, otherwise an in-process store
async fn init_store(config: &Config) -> Result<Arc<dyn FrameStore>> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("No database URL configured; frame records are kept in memory");
        return Ok(Arc::new(MemoryFrameStore::new()));
    };

    let store = PgFrameStore::new(&config.database, url)
        .await
        .context("Failed to initialize frame store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.log_format == "pretty" {
        subscriber.with(fmt::layer().pretty()).init();
    } else {
        subscriber.with(fmt::layer().json()).init();
    }
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
            error!(error = %e, "Failed to install Ctrl+C handler");
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
