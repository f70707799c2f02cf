//! lodestone-daemon: a standalone DHT node with an interactive shell.
//!
//! Usage: `lodestone-daemon [config.toml]`. Without a config file the
//! daemon binds an OS default address with no seeds; see
//! [`config::DaemonConfig`] for the file format.

mod config;
mod shell;

use std::path::Path;

use tracing::{info, warn};

use lodestone_dht::node::Node;

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lodestone=info".parse()?),
        )
        .init();

    info!("lodestone daemon starting");

    let config_arg = std::env::args().nth(1);
    let config = DaemonConfig::load(config_arg.as_deref().map(Path::new))?;

    let node = Node::bind(config.node_config()).await?;
    info!(id = %node.local_id(), addr = %node.local_addr(), "node bound");

    if config.seeds.is_empty() {
        info!("no seeds configured, starting a fresh network");
    } else {
        match node.bootstrap(&config.seeds).await {
            Ok(outcome) => info!(
                responsive_seeds = outcome.responsive_seeds,
                peers_known = outcome.peers_known,
                "joined network"
            ),
            Err(e) => warn!(error = %e, "bootstrap failed, continuing standalone"),
        }
    }

    shell::run(&node).await?;

    info!("shutting down");
    node.close();
    Ok(())
}
