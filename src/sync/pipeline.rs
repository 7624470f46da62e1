//! The per-chain pass: nine stages in fixed order.

use super::{ChainSync, StageResult, SyncContext, SyncEnv};
use crate::assets::{ipfs_cid, metadata_image};
use crate::models::SyncStage;
use log::{info, warn};
use std::collections::BTreeSet;
use std::time::Instant;

/// Run one pass for `chain`. Returns whether every stage completed.
pub(crate) async fn run_chain(chain: &ChainSync, env: &SyncEnv, ctx: &SyncContext) -> bool {
    let started = Instant::now();
    let bootstrapped = {
        let mut ds = chain.dataset.write().await;
        ds.updated.reset();
        ds.bootstrap_completed
    };
    info!("[{}] sync pass started (bootstrapped: {})", chain.name(), bootstrapped);

    let mut completed = true;
    for stage in SyncStage::ALL {
        let stage_started = Instant::now();
        let result = match stage {
            SyncStage::Counts => chain.sync_counts(env, ctx).await,
            SyncStage::Listings => chain.sync_listings(env, ctx).await,
            SyncStage::Collections => chain.sync_collections(env, ctx).await,
            SyncStage::Releases => chain.sync_releases(env, ctx).await,
            SyncStage::TokenPrices => chain.sync_token_prices(env, ctx).await,
            SyncStage::SaleCollections => chain.resolve_sale_collections(ctx).await,
            SyncStage::ReleaseSales => chain.scan_release_sales(env, ctx).await,
            SyncStage::ListingCollections => chain.resolve_listing_collections(ctx, bootstrapped).await,
            SyncStage::IpfsPins => chain.pin_ipfs_images(env, ctx).await,
        };
        env.services
            .metrics
            .record_stage(chain.name(), stage.as_str(), stage_started.elapsed());

        if result == StageResult::Cancelled {
            warn!(
                "[{}] pass cancelled during {} after {:?}",
                chain.name(),
                stage,
                ctx.elapsed()
            );
            completed = false;
            break;
        }
        chain.dataset.write().await.updated.mark(stage);
        info!("[{}] {} done in {:?}", chain.name(), stage, stage_started.elapsed());
    }

    let mut ds = chain.dataset.write().await;
    ds.last_sync_duration_ms = started.elapsed().as_millis() as u64;
    ds.last_sync_completed = completed;
    if completed {
        ds.bootstrap_completed = true;
    }
    info!(
        "[{}] sync pass finished in {} ms (completed: {})",
        chain.name(),
        ds.last_sync_duration_ms,
        completed
    );
    completed
}

impl ChainSync {
    pub(crate) async fn sync_counts(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        let metrics = &env.services.metrics;
        for version in self.config.versions() {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            metrics.record_fetch("listing_count");
            match self.client.total_listings(version).await {
                Ok(Some(total)) => {
                    self.dataset.write().await.total_listings.insert(version, total);
                }
                Ok(None) => metrics.record_not_found("listing_count"),
                Err(e) => self.note_source_error(env, "listing_count", &version, &e),
            }
        }

        if ctx.is_cancelled() {
            return StageResult::Cancelled;
        }
        metrics.record_fetch("collection_count");
        match self.client.total_collections().await {
            Ok(Some(total)) => self.dataset.write().await.total_collections = total,
            Ok(None) => metrics.record_not_found("collection_count"),
            Err(e) => self.note_source_error(env, "collection_count", &"collections", &e),
        }

        if ctx.is_cancelled() {
            return StageResult::Cancelled;
        }
        metrics.record_fetch("release_count");
        match self.client.total_releases().await {
            Ok(Some(total)) => self.dataset.write().await.total_releases = total,
            Ok(None) => metrics.record_not_found("release_count"),
            Err(e) => self.note_source_error(env, "release_count", &"releases", &e),
        }
        StageResult::Completed
    }

    pub(crate) async fn sync_token_prices(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        for token in &self.config.payment_tokens {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            env.services.prices.refresh(&token.price_key).await;
        }
        StageResult::Completed
    }

    /// Submit every IPFS image reference found among cached NFTs as one batch.
    pub(crate) async fn pin_ipfs_images(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        let Some(pinner) = env.services.pinner.as_ref() else {
            return StageResult::Completed;
        };

        let cids: BTreeSet<String> = {
            let ds = self.dataset.read().await;
            let mut refs: Vec<String> = Vec::new();
            for nft in &ds.nfts {
                if let Some(images) = &nft.images {
                    refs.push(images.high_res.clone());
                    refs.push(images.low_res.clone());
                }
                refs.extend(nft.metadata.as_ref().and_then(metadata_image));
                for token in &nft.tokens {
                    if let Some(images) = &token.images {
                        refs.push(images.high_res.clone());
                        refs.push(images.low_res.clone());
                    }
                    refs.extend(token.metadata.as_ref().and_then(metadata_image));
                }
            }
            refs.iter().filter_map(|r| ipfs_cid(r)).collect()
        };
        if cids.is_empty() {
            return StageResult::Completed;
        }
        if ctx.is_cancelled() {
            return StageResult::Cancelled;
        }

        let batch: Vec<String> = cids.into_iter().collect();
        env.services.metrics.record_fetch("pin");
        match pinner.pin(&batch).await {
            Ok(accepted) => info!("[{}] pinned {}/{} IPFS images", self.config.name, accepted, batch.len()),
            Err(e) => self.note_source_error(env, "pin", &batch.len(), &e),
        }
        StageResult::Completed
    }
}
