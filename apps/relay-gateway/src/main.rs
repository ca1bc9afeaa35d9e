use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use relay_gateway::Gateway;
use relay_gateway::cli::Cli;
use relay_gateway::telemetry::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = cli
        .gateway
        .to_config()
        .on_ready(|remote_id| println!("remote id: {remote_id}"));
    let gateway = Gateway::new(config).context("failed to build gateway")?;
    gateway.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(target: "relay_gateway::gateway", "interrupt received");
    gateway.stop().await;
    Ok(())
}
