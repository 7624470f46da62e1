//! Fleet pass, snapshot load/save and the read-layer API.

use super::pipeline::run_chain;
use super::{ChainSync, SyncContext, SyncEnv, SyncServices};
use crate::cache_aside::CachePolicy;
use crate::chain_client::ChainClient;
use crate::error::{PersistenceError, SyncError};
use crate::metrics::SyncMetrics;
use crate::models::{
    ChainDataset, CollectionRecord, ListingRecord, NftRecord, NftTokenEntry, OfferRecord, PriceCacheEntry,
    ReleaseRecord, ReleaseSaleRecord, StageFlags,
};
use crate::persistence::SnapshotStore;
use crate::settings::{ChainConfig, SyncSettings};
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use futures::future::join_all;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Result of one fleet pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub duration: Duration,
    /// Chains whose pipeline was cut short by the deadline.
    pub incomplete_chains: Vec<String>,
    /// The pass ran under the longer bootstrap budget.
    pub bootstrap: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain: String,
    pub chain_id: u64,
    pub updated: StageFlags,
    pub last_sync_duration_ms: u64,
    pub last_sync_completed: bool,
    pub bootstrap_completed: bool,
    pub last_scanned_block: Option<u64>,
    pub listings: usize,
    pub collections: usize,
    pub releases: usize,
    pub release_sales: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub chains: Vec<ChainStatus>,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub incomplete_chains: Vec<String>,
}

#[derive(Debug, Default)]
struct LastPass {
    finished_at: Option<DateTime<Utc>>,
    incomplete_chains: Vec<String>,
}

pub struct SyncEngine {
    chains: Vec<ChainSync>,
    env: SyncEnv,
    store: Arc<dyn SnapshotStore>,
    /// Snapshot datasets for chains that are no longer configured. Saved back untouched.
    dormant: RwLock<Vec<ChainDataset>>,
    cancel: Arc<AtomicBool>,
    last_pass: RwLock<LastPass>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        chains: Vec<(ChainConfig, Arc<dyn ChainClient>)>,
        services: SyncServices,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let chains = chains
            .into_iter()
            .map(|(config, client)| ChainSync::new(config, client, &settings))
            .collect();
        Self {
            chains,
            env: SyncEnv { services, policy: CachePolicy::new(settings.cache_ttl()), settings },
            store,
            dormant: RwLock::new(Vec::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            last_pass: RwLock::new(LastPass::default()),
        }
    }

    /// Override the entity cache TTL taken from the settings.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.env.policy = CachePolicy::new(ttl);
        self
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.env.services.metrics
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.env.settings
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.chains.iter().map(|c| c.name().to_string()).collect()
    }

    fn chain(&self, name: &str) -> Result<&ChainSync, SyncError> {
        self.chains
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| SyncError::UnknownChain(name.to_string()))
    }

    /// Stop the running pass at the next unit of work.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Replace the default datasets with the stored snapshot. Returns whether one was
    /// applied; on failure the defaults stay in place.
    pub async fn load_snapshot(&self) -> bool {
        let datasets = match self.store.load().await {
            Ok(Some(datasets)) => datasets,
            Ok(None) => return false,
            Err(e) => {
                error!("Failed to load snapshot, starting from defaults: {}", e);
                return false;
            }
        };

        let mut dormant = Vec::new();
        for mut dataset in datasets {
            match self.chains.iter().find(|c| c.name() == dataset.chain) {
                Some(chain) => {
                    for version in chain.config.versions() {
                        dataset.total_listings.entry(version).or_insert(0);
                    }
                    info!(
                        "[{}] restored {} listings, {} collections, {} releases (cursor {:?})",
                        dataset.chain,
                        dataset.listings.len(),
                        dataset.collections.len(),
                        dataset.releases.len(),
                        dataset.last_scanned_block
                    );
                    *chain.dataset.write().await = dataset;
                }
                None => {
                    warn!("Keeping snapshot of unconfigured chain '{}' without syncing it", dataset.chain);
                    dormant.push(dataset);
                }
            }
        }
        *self.dormant.write().await = dormant;
        true
    }

    pub async fn save_snapshot(&self) -> Result<(), PersistenceError> {
        let mut datasets = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            datasets.push(chain.dataset.read().await.clone());
        }
        datasets.extend(self.dormant.read().await.iter().cloned());
        self.store.save(&datasets).await
    }

    async fn all_bootstrapped(&self) -> bool {
        for chain in &self.chains {
            if !chain.dataset.read().await.bootstrap_completed {
                return false;
            }
        }
        true
    }

    /// One full pass over every chain, then a snapshot save.
    pub async fn run_pass(&self) -> PassReport {
        self.cancel.store(false, Ordering::Relaxed);
        let bootstrapped = self.all_bootstrapped().await;
        let ctx = SyncContext::new(self.env.settings.max_pass_duration(bootstrapped), self.cancel.clone());
        info!(
            "Starting sync pass over {} chains (budget {:?})",
            self.chains.len(),
            ctx.budget()
        );

        let started = Instant::now();
        let results = join_all(self.chains.iter().map(|chain| run_chain(chain, &self.env, &ctx))).await;
        let incomplete_chains: Vec<String> = self
            .chains
            .iter()
            .zip(results)
            .filter(|(_, completed)| !completed)
            .map(|(chain, _)| chain.name().to_string())
            .collect();
        let duration = started.elapsed();

        self.env.services.metrics.record_pass(duration, &incomplete_chains);
        if incomplete_chains.is_empty() {
            info!("Sync pass completed in {:?}", duration);
        } else {
            warn!("Sync pass ended after {:?}, incomplete chains: {:?}", duration, incomplete_chains);
        }
        {
            let mut last = self.last_pass.write().await;
            last.finished_at = Some(Utc::now());
            last.incomplete_chains = incomplete_chains.clone();
        }

        if let Err(e) = self.save_snapshot().await {
            error!("Failed to save snapshot: {}", e);
        }

        PassReport { duration, incomplete_chains, bootstrap: !bootstrapped }
    }

    /// Copy of one chain's dataset.
    pub async fn dataset(&self, chain: &str) -> Result<ChainDataset, SyncError> {
        Ok(self.chain(chain)?.dataset.read().await.clone())
    }

    pub async fn listing(&self, chain: &str, version: u32, id: u64, force: bool) -> Result<ListingRecord, SyncError> {
        self.chain(chain)?
            .retrieve_listing(&self.env, version, id, force)
            .await
            .ok_or_else(|| SyncError::not_found("listing", format!("{}:{}", version, id)))
    }

    pub async fn offer(
        &self,
        chain: &str,
        version: u32,
        listing_id: u64,
        token: Address,
        offer_id: u64,
        force: bool,
    ) -> Result<OfferRecord, SyncError> {
        self.listing(chain, version, listing_id, false).await?;
        self.chain(chain)?
            .retrieve_offer(&self.env, version, listing_id, token, offer_id, force)
            .await
            .ok_or_else(|| {
                SyncError::not_found("offer", format!("{}:{}:{:?}:{}", version, listing_id, token, offer_id))
            })
    }

    pub async fn collection(&self, chain: &str, id: u64, force: bool) -> Result<CollectionRecord, SyncError> {
        self.chain(chain)?
            .retrieve_collection(&self.env, id, force)
            .await
            .ok_or_else(|| SyncError::not_found("collection", id))
    }

    pub async fn release(&self, chain: &str, id: u64, force: bool) -> Result<ReleaseRecord, SyncError> {
        self.chain(chain)?
            .retrieve_release(&self.env, id, force)
            .await
            .ok_or_else(|| SyncError::not_found("release", id))
    }

    pub async fn nft(&self, chain: &str, address: Address, force: bool) -> Result<NftRecord, SyncError> {
        self.chain(chain)?
            .retrieve_nft(&self.env, address, force)
            .await
            .ok_or_else(|| SyncError::not_found("nft", format!("{:?}", address)))
    }

    pub async fn nft_token(
        &self,
        chain: &str,
        address: Address,
        token_id: U256,
        force: bool,
    ) -> Result<NftTokenEntry, SyncError> {
        self.chain(chain)?
            .retrieve_nft_token(&self.env, address, token_id, force)
            .await
            .ok_or_else(|| SyncError::not_found("nft_token", format!("{:?}/{}", address, token_id)))
    }

    async fn filter_listings<F>(&self, chain: &str, keep: F) -> Result<Vec<ListingRecord>, SyncError>
    where
        F: Fn(&ListingRecord) -> bool,
    {
        let ds = self.chain(chain)?.dataset.read().await;
        Ok(ds.listings.iter().filter(|l| keep(l)).cloned().collect())
    }

    pub async fn open_listings(&self, chain: &str) -> Result<Vec<ListingRecord>, SyncError> {
        self.filter_listings(chain, |l| l.is_open()).await
    }

    pub async fn listings_by_state(&self, chain: &str, sale_state: u8) -> Result<Vec<ListingRecord>, SyncError> {
        self.filter_listings(chain, |l| l.sale_state == sale_state).await
    }

    pub async fn listings_by_owner(&self, chain: &str, owner: Address) -> Result<Vec<ListingRecord>, SyncError> {
        self.filter_listings(chain, |l| l.owner == owner).await
    }

    /// Listings of `nft`, optionally narrowed to one token.
    pub async fn listings_by_nft(
        &self,
        chain: &str,
        nft: Address,
        token_id: Option<U256>,
    ) -> Result<Vec<ListingRecord>, SyncError> {
        self.filter_listings(chain, |l| l.nft_address == nft && token_id.map_or(true, |t| l.token_id == t))
            .await
    }

    pub async fn sold_listings(&self, chain: &str) -> Result<Vec<ListingRecord>, SyncError> {
        self.filter_listings(chain, |l| l.was_sold).await
    }

    pub async fn collections(&self, chain: &str) -> Result<Vec<CollectionRecord>, SyncError> {
        Ok(self.chain(chain)?.dataset.read().await.collections.clone())
    }

    pub async fn releases(&self, chain: &str) -> Result<Vec<ReleaseRecord>, SyncError> {
        Ok(self.chain(chain)?.dataset.read().await.releases.clone())
    }

    pub async fn release_sales(&self, chain: &str) -> Result<Vec<ReleaseSaleRecord>, SyncError> {
        Ok(self.chain(chain)?.dataset.read().await.release_sales.clone())
    }

    /// Last cached USD price for an oracle token key. Never calls the oracle.
    pub fn token_price(&self, price_key: &str) -> Option<PriceCacheEntry> {
        self.env.services.prices.get(price_key)
    }

    pub async fn status(&self) -> EngineStatus {
        let mut chains = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            let ds = chain.dataset.read().await;
            chains.push(ChainStatus {
                chain: ds.chain.clone(),
                chain_id: ds.chain_id,
                updated: ds.updated.clone(),
                last_sync_duration_ms: ds.last_sync_duration_ms,
                last_sync_completed: ds.last_sync_completed,
                bootstrap_completed: ds.bootstrap_completed,
                last_scanned_block: ds.last_scanned_block,
                listings: ds.listings.len(),
                collections: ds.collections.len(),
                releases: ds.releases.len(),
                release_sales: ds.release_sales.len(),
            });
        }
        let last = self.last_pass.read().await;
        EngineStatus {
            chains,
            last_pass_at: last.finished_at,
            incomplete_chains: last.incomplete_chains.clone(),
        }
    }
}
