use std::sync::Arc;

use mcp_device_server::{
    config::Config, domain::tools::ToolRegistry, logging, server::SessionManager,
};
use tokio::{net::TcpListener, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let registry = Arc::new(ToolRegistry::with_default_tools()?);
    let bind_socket = config.bind_socket()?;
    let manager = Arc::new(SessionManager::from_config(&config, registry));
    let listener = TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        framing = %config.framing,
        max_message_size = config.max_message_size,
        server_name = %config.server_name,
        "server starting"
    );

    tokio::select! {
        served = Arc::clone(&manager).serve(listener) => served?,
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }

    manager.shutdown_all().await;
    info!(stats = ?manager.stats(), "server stopped");
    Ok(())
}
