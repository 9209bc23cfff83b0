//! Fleet agent binary.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_agent::{Agent, AgentConfig, SystemProvider};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("fleet agent {} starting", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent config")?;
    let provider = Arc::new(SystemProvider::new());
    let agent = Agent::new(config, provider).context("Failed to create agent")?;

    agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
        .context("Agent execution failed")
}
