use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use marketplace_broker::rabbitmq::LapinClient;
use marketplace_broker::{Config, ConnectionManager, QueueService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("Invalid broker configuration")?;
    info!(
        url = %config.redacted_url(),
        reconnect_delay = ?config.reconnect_delay,
        prefetch = config.prefetch_count,
        "Starting message broker client"
    );

    let manager = ConnectionManager::new(&config, Arc::new(LapinClient::new()));
    let service = QueueService::new(manager);

    if let Err(e) = service.connection().connect().await {
        // no retries once we exit
        let _ = service.close().await;
        return Err(e).context("Failed to connect to RabbitMQ");
    }
    info!("Message broker ready");

    shutdown_signal().await;

    info!("Shutting down, closing RabbitMQ connection");
    if let Err(e) = service.close().await {
        warn!("Error during shutdown: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
