//! Swap coordinator devnet - both sides of an HTLC swap over simulated chains
//!
//! Runs an owner host and a participant host in one process, exposes the
//! control API and optionally starts a demo swap.

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use swap_coordinator::api;
use swap_coordinator::config::Settings;
use swap_coordinator::devnet::Devnet;
use swap_coordinator::metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting swap coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration (store: {:?}, token: {})",
        settings.store.backend, settings.devnet.token
    );

    // Hosts, chains and restored flows
    let devnet = Devnet::new(&settings).await?;
    info!("Devnet initialized with {} hosts", devnet.hosts.len());

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let hosts = devnet.hosts.clone();
        async move {
            if let Err(e) = api::run_server(config, hosts).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    if settings.devnet.demo_swap && !settings.devnet.token.is_empty() {
        match devnet.start_demo().await {
            Ok(id) => info!("Demo swap: {}", id),
            Err(e) => error!("Demo swap failed to start: {}", e),
        }
    }

    info!("Swap coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Flows stop, snapshots stay for the next start
    devnet.stop();

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,swap_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
