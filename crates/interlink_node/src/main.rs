//! Interlink node: runs one relay endpoint (hub or spoke) and one pub/sub
//! bus from a TOML configuration file.

mod cli;
mod config;
mod logging;
mod node;
mod signals;

use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::cli::CliArgs;
use crate::config::{BrokerKind, NodeConfig, NodeRole};
use crate::node::Node;

async fn load_config(args: &CliArgs) -> anyhow::Result<NodeConfig> {
    let mut config = NodeConfig::load_from_file(&args.config_path).await?;

    if let Some(role) = &args.role {
        config.node.role = role.parse::<NodeRole>()?;
    }
    if let Some(server_id) = &args.server_id {
        config.node.server_id = server_id.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;
    Ok(config)
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = load_config(&args).await?;
    logging::setup_logging(&config.logging)?;

    info!(
        "🚀 Interlink node v{} - {}/{} as {}",
        env!("CARGO_PKG_VERSION"),
        config.node.environment,
        config.node.server_id,
        config.node.role
    );
    info!("📂 Config: {}", args.config_path.display());
    if config.relay.enabled {
        info!("  🌐 Relay address: {}", config.relay.address);
        info!("  🔐 Allowed peers: {:?}", config.relay.allowed_peers);
    }
    if config.bus.enabled {
        match config.bus.broker {
            BrokerKind::Redis => info!("  📮 Bus broker: Redis at {}", config.redis_settings().redacted_url()),
            BrokerKind::Memory => info!("  📮 Bus broker: in-process"),
        }
    }

    let broker = config.broker_connector().context("configuring bus broker")?;
    let node = Node::new(config, broker).context("building node")?;
    node.start()?;
    node.announce(Duration::from_secs(5)).await?;
    info!("🛑 Press Ctrl+C to gracefully shutdown");

    node.run_until(signals::next_stop_signal()).await?;
    info!("👋 Interlink node shut down");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        error!("❌ Node error: {:?}", e);
        eprintln!("❌ Failed to run node: {e:?}");
        std::process::exit(1);
    }
}
