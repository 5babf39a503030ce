use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use log::info;
use tokio_util::sync::CancellationToken;

use tos_discovery::{
    load_identity, DiscoveryApp, DiscoveryConfig, MemoryNetworkStorage, NetworkStorage,
    RocksNetworkStorage,
};

#[derive(Parser)]
#[clap(version, about = "TOS Network standalone discovery node")]
struct Args {
    #[clap(flatten)]
    discovery: DiscoveryConfig,

    /// JSON file holding the discovery configuration.
    /// When set, it replaces the command line options.
    #[clap(long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config_file {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&content).context("Failed to parse config file")?
        }
        None => args.discovery,
    };

    let storage: Arc<dyn NetworkStorage> = match &config.data_dir {
        Some(dir) => Arc::new(RocksNetworkStorage::open(dir).context("Failed to open peer database")?),
        None => Arc::new(MemoryNetworkStorage::new()),
    };

    let identity = load_identity(&config).context("Failed to load node identity")?;
    let app = DiscoveryApp::new(config, storage)?;
    app.initialize(identity)?;
    app.start().await?;

    if let Some(url) = app.node_url() {
        info!("Node address: {}", url);
    }

    let cancel = CancellationToken::new();
    let mut nodes = app.discover_nodes(cancel.clone())?;
    let printer = tokio::spawn(async move {
        while let Some(node) = nodes.next().await {
            info!("Discovered {}", node);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    cancel.cancel();
    app.stop().await;
    printer.await?;
    Ok(())
}
