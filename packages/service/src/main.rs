//! Credit-ledger node daemon.

mod config;
mod init;

use actors::SupervisorMessage;

use crate::config::Config;
use crate::init::init_ledger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config::from_env()?;
    let node = init_ledger(&config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let _ = node.supervisor.send_message(SupervisorMessage::Shutdown);
    node.pipeline.abort();

    Ok(())
}
