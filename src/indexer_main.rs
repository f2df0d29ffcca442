//! Guild event indexer binary
//!
//! Polls the chain for events from the XP system and deployment tracker
//! contracts and applies them to the local progression store.

use anyhow::{Context, Result};
use clap::Parser;
use guildwatch::config::{load_badge_templates, parse_address, PollerConfig};
use guildwatch::poller::Poller;
use guildwatch::progression::DEPLOYMENT_XP_REWARD;
use guildwatch::router::WatchedContracts;
use guildwatch::rpc::RpcClient;
use guildwatch::store::{ProgressStore, RocksProgressStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Guild event indexer
#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Index guild contract events into the progression store")]
struct Args {
    /// RPC endpoint URL
    #[arg(short, long, default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Path to RocksDB database directory
    #[arg(short, long, default_value = "./guild_db")]
    db_path: PathBuf,

    /// XP system contract address
    #[arg(long)]
    xp_system: String,

    /// Deployment tracker contract address
    #[arg(long)]
    deployment_tracker: String,

    /// Seconds between poll cycles
    #[arg(long, default_value_t = 10)]
    poll_interval_secs: u64,

    /// Blocks per cursor advance
    #[arg(long, default_value_t = 100)]
    batch_size: u64,

    /// First block to scan on an empty database (defaults to block 1)
    #[arg(long)]
    start_block: Option<u64>,

    /// XP granted per successful contract deployment
    #[arg(long, default_value_t = DEPLOYMENT_XP_REWARD)]
    deployment_reward: u64,

    /// Badge template JSON file to load at start-up
    #[arg(short, long)]
    badges: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let contracts = WatchedContracts {
        xp_system: parse_address(&args.xp_system).context("Invalid XP system address")?,
        deployment_tracker: parse_address(&args.deployment_tracker)
            .context("Invalid deployment tracker address")?,
    };
    let config = PollerConfig {
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        batch_size: args.batch_size,
        start_block: args.start_block,
        deployment_reward: args.deployment_reward,
    };

    info!("Starting guild event indexer");
    info!("RPC URL: {}", args.rpc_url);
    info!("Database: {:?}", args.db_path);
    info!(xp_system = ?contracts.xp_system, deployment_tracker = ?contracts.deployment_tracker, "Watching contracts");

    let rpc = RpcClient::new(args.rpc_url);
    let chain_id = rpc.get_chain_id().await.context("Failed to get chain id")?;
    info!(chain_id, "Connected");

    let store = RocksProgressStore::open(&args.db_path)
        .with_context(|| format!("Failed to open database at {:?}", args.db_path))?;

    if let Some(path) = &args.badges {
        let templates = load_badge_templates(path)?;
        for template in &templates {
            store.put_badge_template(template)?;
        }
        info!("Loaded {} badge templates", templates.len());
    }

    let poller = Poller::new(store, rpc, contracts, config, chain_id)?;

    // Ctrl+C stops the poller between blocks
    let shutdown = poller.shutdown_handle();
    let signal = async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.trigger();
        }
    };
    let (result, ()) = tokio::join!(poller.run(), signal);
    result.context("Poller error")?;

    info!("Indexer stopped");
    Ok(())
}
