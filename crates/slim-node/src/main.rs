use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use slim_node::{Node, NodeConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "slim-node")]
#[command(about = "SLIM routing node", long_about = None)]
struct Cli {
    /// Node configuration file (.toml or .json).
    #[arg(short, long, env = "SLIM_NODE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::from_file(&cli.config)?;

    let filter = match &config.log_filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!(config = %cli.config.display(), "slim node starting");
    let node = Node::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    node.shutdown();
    Ok(())
}
