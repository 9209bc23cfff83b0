/**
 * FLEET KERNEL - entry point of the telemetry aggregator
 *
 * ROLE: load `.env` and the YAML config, restore durable state, serve the
 * wire protocol until Ctrl-C, then stop timers and flush.
 */

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet_kernel::{load_config, Kernel};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await;
    let listen = config.listen;
    let kernel = Kernel::open(config).context("kernel start-up failed")?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot bind {listen}"))?;

    kernel
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("kernel stopped");
    Ok(())
}
