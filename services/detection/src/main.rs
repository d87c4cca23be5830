use anyhow::{Context, Result};
use detection_service::api::{start_api_server, AppState};
use detection_service::{Config, HttpDetectionClient, Orchestrator, PgStore, RetryPolicy, StorageLayout};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Detection Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = Arc::new(
        PgStore::new(&config.database)
            .await
            .context("Failed to initialize detection store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let backend = Arc::new(
        HttpDetectionClient::new(&config.backend).context("Failed to initialize detection client")?,
    );

    let layout = StorageLayout::from_config(&config.storage);
    tokio::fs::create_dir_all(layout.annotated_root())
        .await
        .with_context(|| {
            format!(
                "Failed to create annotated directory {}",
                layout.annotated_root().display()
            )
        })?;

    info!(
        endpoint = %backend.endpoint(),
        max_attempts = config.backend.max_attempts,
        upload_root = %layout.upload_root().display(),
        "Detection pipeline configured"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        backend,
        RetryPolicy::new(config.backend.max_attempts, config.backend.retry_base_delay()),
        layout,
    ));

    let api_state = AppState {
        orchestrator,
        db_pool: Some(store.pool().clone()),
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
    store.pool().close().await;

    info!("Detection service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
