use std::sync::Arc;
use tracing::info;

use chatting::{bus::BroadcastHub, config::Config, http, service::ChatService, store::Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Chat service starting...");

    let config = Config::from_env()?;

    info!("Initializing store at {}", config.database_path.display());
    let store = Store::new(&config.database_path).await?;
    store.init().await?;

    let service = ChatService::new(
        Arc::new(store.rooms()),
        Arc::new(store.messages().with_poll_interval(config.stream_poll_interval)),
        BroadcastHub::with_capacity(config.broadcast_capacity),
    )
    .with_max_page_size(config.max_page_size);

    let app = http::router(service, config.default_page_size);

    info!("Starting chat server on port {}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
