use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tracked_sync::config::ServerConfig;
use tracked_sync::game::simulation::HeadlessSimulation;
use tracked_sync::metrics::{self, Metrics};
use tracked_sync::net::queue::InboundQueue;
use tracked_sync::net::runner::run_server;
use tracked_sync::net::server_session::ServerSession;
use tracked_sync::net::transport::ServerTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Tracked Sync server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        anyhow::bail!("invalid configuration: {e}");
    }
    info!(
        tcp = %config.tcp_addr(),
        udp = %config.udp_addr(),
        max_clients = config.max_clients,
        tick_rate = config.tick_rate,
        scenes = config.builtin_scenes.len(),
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let queue = InboundQueue::new(config.inbound_capacity);
    let transport = ServerTransport::bind(&config, queue.sender(), Some(metrics.clone())).await?;
    let session = ServerSession::from_config(&config, HeadlessSimulation::new()).with_metrics(metrics.clone());

    info!("Server ready on {}", transport.tcp_addr());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = run_server(session, transport, queue, config.tick_rate, Some(metrics.clone())) => {}
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        ticks = snapshot.tick_count,
        packets_sent = snapshot.packets_sent,
        packets_received = snapshot.packets_received,
        "Server stopped"
    );

    Ok(())
}
