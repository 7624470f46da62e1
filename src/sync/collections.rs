//! Collections stage and the two listing-to-collection resolution stages.

use super::{ChainSync, StageResult, SyncContext, SyncEnv};
use crate::models::{ChainDataset, CollectionRecord};
use ethers::types::Address;

/// Point listing `idx` at the first collection containing its NFT, or clear it.
fn assign_collection(ds: &mut ChainDataset, idx: usize) {
    let nft = ds.listings[idx].nft_address;
    let found = ds.collection_for_nft(nft).map(|c| (c.id, c.name.clone()));
    let listing = &mut ds.listings[idx];
    match found {
        Some((id, name)) => {
            listing.collection_id = Some(id);
            listing.collection_name = Some(name);
        }
        None => {
            listing.collection_id = None;
            listing.collection_name = None;
        }
    }
}

impl ChainSync {
    pub(crate) async fn retrieve_collection(&self, env: &SyncEnv, id: u64, force: bool) -> Option<CollectionRecord> {
        self.retrieve_cached(
            env,
            "collection",
            &id,
            force,
            |ds| Some(&ds.collections),
            |ds| Some(&mut ds.collections),
            || self.client.collection(id),
        )
        .await
    }

    pub(crate) async fn sync_collections(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        let cached: Vec<u64> = self.dataset.read().await.collections.iter().map(|c| c.id).collect();
        for id in cached {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_collection(env, id, true).await;
        }

        let (cached, total) = {
            let ds = self.dataset.read().await;
            (ds.collections.len() as u64, ds.total_collections)
        };
        for id in cached..total {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_collection(env, id, false).await;
        }

        let mut members: Vec<Address> = Vec::new();
        for collection in self.dataset.read().await.collections.iter() {
            for nft in &collection.nft_addresses {
                if !members.contains(nft) {
                    members.push(*nft);
                }
            }
        }
        for nft in members {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_nft(env, nft, false).await;
        }
        StageResult::Completed
    }

    pub(crate) async fn resolve_sale_collections(&self, ctx: &SyncContext) -> StageResult {
        let mut ds = self.dataset.write().await;
        for idx in 0..ds.listings.len() {
            if !ds.listings[idx].was_sold {
                continue;
            }
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            assign_collection(&mut ds, idx);
        }
        StageResult::Completed
    }

    /// Before the first full pass every listing is resolved, afterwards only live ones.
    pub(crate) async fn resolve_listing_collections(&self, ctx: &SyncContext, bootstrapped: bool) -> StageResult {
        let mut ds = self.dataset.write().await;
        for idx in 0..ds.listings.len() {
            if bootstrapped && ds.listings[idx].finalized {
                continue;
            }
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            assign_collection(&mut ds, idx);
        }
        StageResult::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing;

    #[test]
    fn test_assign_collection_sets_and_clears() {
        let nft = Address::from_low_u64_be(0xa1);
        let mut ds = ChainDataset::new("testnet", 1, &[1]);
        let mut listing = testing::listing(1, 0);
        listing.nft_address = nft;
        listing.collection_id = Some(9);
        ds.listings.push(listing);

        assign_collection(&mut ds, 0);
        assert_eq!(ds.listings[0].collection_id, None);

        ds.collections.push(testing::collection(3, "Genesis", vec![nft]));
        ds.collections.push(testing::collection(4, "Other", vec![nft]));
        assign_collection(&mut ds, 0);
        assert_eq!(ds.listings[0].collection_id, Some(3));
        assert_eq!(ds.listings[0].collection_name.as_deref(), Some("Genesis"));
    }
}
