//! # Market Sync Daemon
//!
//! Keeps the marketplace snapshot of every configured chain up to date.
//!
//! ## Overview
//!
//! This service:
//! - Restores the last snapshot (`sync.snapshot_path`) on startup
//! - Runs a full sync pass every `sync.interval_seconds`, never overlapping
//! - Logs and resets the sync counters every `sync.metrics_reset_seconds`
//! - Handles graceful shutdown on Ctrl+C, letting the running pass wind down
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin market_syncd -- --config Config.toml
//! cargo run --bin market_syncd -- --once
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use market_sync::{
    assets::{AssetCache, DiskAssetCache, HttpPinner, Pinner},
    chain_client::{ChainClient, EthersChainClient},
    metrics::SyncMetrics,
    persistence::JsonFileStore,
    price_oracle::{CoinGeckoOracle, PriceBook},
    settings::Settings,
    sync::{Scheduler, SyncEngine, SyncServices},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "market_syncd", about = "Multi-chain marketplace sync daemon")]
struct Args {
    /// Configuration file (TOML).
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Run a single pass, save the snapshot and exit.
    #[arg(long)]
    once: bool,

    /// Serve Prometheus metrics on this address.
    #[cfg(feature = "observability")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    env_logger::init();

    let args = Args::parse();

    // 1. Load settings
    let settings = Settings::from_path(&args.config)
        .with_context(|| format!("failed to load settings from {}", args.config))?;
    info!("Settings loaded: {} chains", settings.chains.len());

    #[cfg(feature = "observability")]
    if let Some(addr) = args.metrics_addr {
        market_sync::metrics::install_prometheus_exporter(addr)?;
        info!("Prometheus exporter listening on {}", addr);
    }

    // 2. Shared collaborators
    let metrics = Arc::new(SyncMetrics::new());
    let oracle = Arc::new(CoinGeckoOracle::new(&settings.price_oracle)?);
    let prices = Arc::new(PriceBook::new(
        oracle,
        Duration::from_secs(settings.price_oracle.cache_ttl_seconds),
        metrics.clone(),
    ));
    let assets: Arc<dyn AssetCache> = Arc::new(DiskAssetCache::new(&settings.assets)?);
    let pinner = HttpPinner::from_settings(&settings.assets)?.map(|p| Arc::new(p) as Arc<dyn Pinner>);
    if pinner.is_none() {
        warn!("No pin endpoint configured, IPFS pin stage will be a no-op");
    }

    // 3. One client per chain
    let mut chains = Vec::with_capacity(settings.chains.len());
    for config in &settings.chains {
        let client = EthersChainClient::connect(config)
            .with_context(|| format!("failed to connect chain {}", config.name))?;
        info!(
            "[{}] chain {} via {} ({} marketplaces)",
            config.name,
            config.chain_id,
            config.rpc_url,
            config.marketplaces().len()
        );
        chains.push((config.clone(), Arc::new(client) as Arc<dyn ChainClient>));
    }

    // 4. Engine
    let store = Arc::new(JsonFileStore::new(settings.sync.snapshot_path.clone()));
    let services = SyncServices { prices, assets, pinner, metrics };
    let engine = Arc::new(SyncEngine::new(settings.sync.clone(), chains, services, store));
    if !engine.load_snapshot().await {
        info!("Starting without a snapshot, first pass is a bootstrap");
    }

    if args.once {
        let report = engine.run_pass().await;
        info!(
            "Single pass finished in {:?}, incomplete chains: {:?}",
            report.duration, report.incomplete_chains
        );
        return Ok(());
    }

    // 5. Shutdown on Ctrl+C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping after the current pass");
            signal_engine.cancel();
            let _ = shutdown_tx.send(true);
        }
    });

    Scheduler::new(engine).run(shutdown_rx).await;
    info!("Shutdown complete");
    Ok(())
}
