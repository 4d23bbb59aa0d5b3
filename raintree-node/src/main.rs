//! RainTree node binary.
//!
//! This is the main entry point, which wires configuration, logging and
//! shutdown handling around the P2P layer.

use tracing_subscriber::EnvFilter;

use raintree_node::cli::Cli;
use raintree_node::config::NodeConfig;
use raintree_node::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("RainTree Node v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = NodeConfig::from_cli(&cli)?;

    // Create and run node
    Node::new(config).run(cli.announce.clone()).await?;

    Ok(())
}
