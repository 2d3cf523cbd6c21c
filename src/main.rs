//! Reference server hosting the broker behind the WebSocket channel.

use std::sync::{Arc, Mutex};

use eftl::broker::{self, Broker};
use eftl::config::load_config;
use eftl::persistence::MapStore;
use eftl::transport::{CloseCode, WebSocketServer};
use eftl::utils::{Result, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    logging::init("info");

    if let Err(e) = run_server().await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server() -> Result<()> {
    let config = load_config()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let store = MapStore::open(&config.broker.data_dir)?;
    let broker = Arc::new(Mutex::new(Broker::new(
        store,
        config.broker.max_message_size,
    )));
    let server = WebSocketServer::bind(&addr, broker.clone(), config).await?;

    tokio::select! {
        _ = server.run() => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker::lock(&broker).close_all(CloseCode::Shutdown, "server shutting down");
    Ok(())
}
