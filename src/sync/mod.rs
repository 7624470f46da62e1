//! # Sync Engine
//!
//! One [`ChainSync`] per configured chain owns that chain's [`ChainDataset`] and its
//! collaborators. A fleet pass ([`engine::SyncEngine::run_pass`]) drives every chain's
//! nine-stage pipeline concurrently under one [`context::SyncContext`].
//!
//! ## Locking
//!
//! Each dataset sits behind its own `tokio::sync::RwLock`. An entity retrieval
//! checks freshness under the read lock, calls the node with no lock held and
//! takes the write lock only to merge the result, so read-layer queries never
//! wait on a node round trip. Chains never share a lock; the only cross-chain
//! state is the [`PriceBook`].

pub mod context;
pub mod engine;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod throttle;

mod collections;
mod listings;
mod nfts;
mod pipeline;
mod releases;

pub use context::SyncContext;
pub use engine::{ChainStatus, EngineStatus, PassReport, SyncEngine};
pub use listings::select_top_offer;
pub use scheduler::Scheduler;

use crate::assets::{AssetCache, Pinner};
use crate::cache_aside::{CachePolicy, Cached, Lookup, Outcome};
use crate::chain_client::{ChainClient, SourceResult};
use crate::error::SourceError;
use crate::metrics::SyncMetrics;
use crate::models::ChainDataset;
use crate::price_oracle::PriceBook;
use crate::settings::{ChainConfig, SyncSettings};
use log::{debug, warn};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use throttle::Throttle;
use tokio::sync::RwLock;

/// Collaborators shared by every chain pipeline.
#[derive(Clone)]
pub struct SyncServices {
    pub prices: Arc<PriceBook>,
    pub assets: Arc<dyn AssetCache>,
    pub pinner: Option<Arc<dyn Pinner>>,
    pub metrics: Arc<SyncMetrics>,
}

/// Everything a stage needs besides its own chain.
pub(crate) struct SyncEnv {
    pub services: SyncServices,
    pub policy: CachePolicy,
    pub settings: SyncSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageResult {
    Completed,
    Cancelled,
}

/// One chain: its configuration, its node client and its dataset.
pub struct ChainSync {
    pub(crate) config: ChainConfig,
    pub(crate) client: Arc<dyn ChainClient>,
    pub(crate) dataset: RwLock<ChainDataset>,
    /// Spacing for historical log queries.
    pub(crate) log_throttle: Throttle,
    /// Spacing for historical price lookups.
    pub(crate) price_throttle: Throttle,
}

impl ChainSync {
    pub fn new(config: ChainConfig, client: Arc<dyn ChainClient>, settings: &SyncSettings) -> Self {
        let dataset = ChainDataset::new(config.name.clone(), config.chain_id, &config.versions());
        Self {
            log_throttle: Throttle::new(settings.throttle_delay()),
            price_throttle: Throttle::new(settings.throttle_delay()),
            dataset: RwLock::new(dataset),
            config,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub(crate) fn note_source_error(
        &self,
        env: &SyncEnv,
        kind: &'static str,
        key: &dyn Debug,
        error: &SourceError,
    ) {
        warn!("[{}] {} {:?}: {}", self.config.name, kind, key, error);
        env.services.metrics.record_source_error(kind, error);
    }

    /// Log and count one cache-aside retrieval.
    pub(crate) fn note_outcome(&self, env: &SyncEnv, kind: &'static str, key: &dyn Debug, outcome: &Outcome) {
        let metrics = &env.services.metrics;
        if outcome.fetched() {
            metrics.record_fetch(kind);
        }
        match outcome {
            Outcome::Hit => {}
            Outcome::Inserted => debug!("[{}] cached new {} {:?}", self.config.name, kind, key),
            Outcome::Refreshed => debug!("[{}] refreshed {} {:?}", self.config.name, kind, key),
            Outcome::Missing | Outcome::Kept => {
                debug!("[{}] {} {:?} not found at source", self.config.name, kind, key);
                metrics.record_not_found(kind);
            }
            Outcome::Failed(e) => self.note_source_error(env, kind, key, e),
        }
    }

    /// Cache-aside retrieval of one record from the vector `read`/`write` select.
    ///
    /// `None` from the selectors means the owning container is not cached
    /// (an offer whose listing is unknown); nothing is fetched then.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn retrieve_cached<T, R, W, F, Fut>(
        &self,
        env: &SyncEnv,
        kind: &'static str,
        key: &T::Key,
        force: bool,
        read: R,
        write: W,
        fetch: F,
    ) -> Option<T>
    where
        T: Cached + Clone,
        R: Fn(&ChainDataset) -> Option<&Vec<T>>,
        W: Fn(&mut ChainDataset) -> Option<&mut Vec<T>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
    {
        {
            let ds = self.dataset.read().await;
            if let Lookup::Hit(record) = env.policy.lookup(read(&*ds)?, key, force) {
                self.note_outcome(env, kind, key, &Outcome::Hit);
                return Some(record);
            }
        }

        let fetched = fetch().await;

        let mut ds = self.dataset.write().await;
        let r = env.policy.merge(write(&mut *ds)?, key, fetched);
        self.note_outcome(env, kind, key, &r.outcome);
        r.record.cloned()
    }
}
