use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ripple_fanout::broker::{BrokerBridge, RedisBackend};
use ripple_fanout::config::Settings;
use ripple_fanout::hub::ConnectionHub;
use ripple_fanout::orchestrator::{spawn_fanout_router, SubscriptionOrchestrator};
use ripple_fanout::registry::ChannelRegistry;
use ripple_fanout::server::{create_app, AppState};

const BROKER_EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Shutdown signal shared by the broker pump and the server
    let (shutdown_tx, _) = broadcast::channel(1);

    // Broker backend and fanout plumbing
    let (events_tx, events_rx) = mpsc::channel(BROKER_EVENT_BUFFER);
    let backend = RedisBackend::connect(&settings.broker, events_tx, shutdown_tx.clone()).await?;
    tracing::info!(url = %settings.broker.url, "Broker connected");

    let registry = Arc::new(ChannelRegistry::new());
    let hub = Arc::new(ConnectionHub::new());
    let bridge = Arc::new(BrokerBridge::new(backend));
    let orchestrator = Arc::new(SubscriptionOrchestrator::new(
        registry.clone(),
        bridge,
        hub.clone(),
    ));

    let router_handle = spawn_fanout_router(registry, hub, events_rx);

    // Create Axum app
    let state = AppState::new(settings.clone(), orchestrator);
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_tx))
        .await?;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = router_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler(shutdown_tx: broadcast::Sender<()>) {
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    let _ = shutdown_tx.send(());
}
