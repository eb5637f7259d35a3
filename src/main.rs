//! # Mesh Dispatcher - Main Entry Point
//!
//! Loads configuration from `MESH_CONFIG_PATH` (built-in defaults when unset),
//! initializes logging and metrics, seeds the static directory and serves until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mesh_dispatcher::observability::logging::init_logging;
use mesh_dispatcher::observability::metrics::install_prometheus;
use mesh_dispatcher::{MeshConfig, MeshResult, MeshServer, StaticDirectory};

#[tokio::main]
async fn main() -> MeshResult<()> {
    let config = load_config().await?;
    init_logging(&config.observability.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mesh = %config.mesh.name,
        "Starting mesh dispatcher"
    );

    let directory = Arc::new(StaticDirectory::with_instances(
        config.discovery.static_instances.clone(),
    ));
    info!(instances = directory.len(), "Static directory seeded");

    let metrics_handle = if config.observability.metrics.enabled {
        Some(install_prometheus(&config.observability.metrics, &config.mesh.name)?)
    } else {
        None
    };

    let mut server = MeshServer::new(config, directory)?;
    if let Some(handle) = metrics_handle {
        server = server.with_metrics_handle(handle);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = server.start(shutdown).await {
        error!("Mesh server error: {}", e);
        return Err(e);
    }

    info!("Mesh dispatcher shutdown complete");
    Ok(())
}

/// Configuration from `MESH_CONFIG_PATH`, or defaults plus environment overrides
async fn load_config() -> MeshResult<MeshConfig> {
    match std::env::var("MESH_CONFIG_PATH") {
        Ok(path) => MeshConfig::load_from_file(&path).await,
        Err(_) => {
            let mut config = MeshConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }

    shutdown.cancel();
}
