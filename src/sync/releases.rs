//! Releases stage and the incremental release-sale block scan.

use super::{ChainSync, StageResult, SyncContext, SyncEnv};
use crate::chain_client::SaleEventKind;
use crate::models::{ReleaseRecord, ReleaseSaleRecord};
use ethers::types::Address;
use log::{debug, info};

impl ChainSync {
    pub(crate) async fn retrieve_release(&self, env: &SyncEnv, id: u64, force: bool) -> Option<ReleaseRecord> {
        self.retrieve_cached(
            env,
            "release",
            &id,
            force,
            |ds| Some(&ds.releases),
            |ds| Some(&mut ds.releases),
            || self.client.release(id),
        )
        .await
    }

    pub(crate) async fn sync_releases(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        let live: Vec<u64> = {
            let ds = self.dataset.read().await;
            ds.releases.iter().filter(|r| !r.ended).map(|r| r.id).collect()
        };
        for id in live {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_release(env, id, true).await;
        }

        let (cached, total) = {
            let ds = self.dataset.read().await;
            (ds.releases.len() as u64, ds.total_releases)
        };
        for id in cached..total {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_release(env, id, false).await;
        }

        let mut nfts: Vec<Address> = Vec::new();
        for release in self.dataset.read().await.releases.iter() {
            if !nfts.contains(&release.nft_address) {
                nfts.push(release.nft_address);
            }
        }
        for nft in nfts {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_nft(env, nft, false).await;
        }
        StageResult::Completed
    }

    /// Walk forward from the cursor in windows until caught up with the head or the
    /// per-pass block budget is spent. The head is re-read before every window.
    ///
    /// A failed window query ends the scan for this pass with the cursor still in
    /// front of that window.
    pub(crate) async fn scan_release_sales(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        let mut cursor = {
            let ds = self.dataset.read().await;
            ds.last_scanned_block
                .unwrap_or_else(|| self.config.start_block.saturating_sub(1))
        };
        let window_size = env.settings.scan_window_blocks.max(1);
        let mut scanned = 0u64;

        loop {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            let budget = env.settings.max_blocks_per_pass.saturating_sub(scanned);
            if budget == 0 {
                info!("[{}] release scan reached its block budget at {}", self.config.name, cursor);
                break;
            }

            env.services.metrics.record_fetch("block");
            let head = match self.client.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    self.note_source_error(env, "block", &"head", &e);
                    break;
                }
            };
            if head <= cursor {
                break;
            }

            let window = window_size.min(head - cursor).min(budget);
            let (from, to) = (cursor + 1, cursor + window);
            self.log_throttle.wait().await;
            env.services.metrics.record_fetch("sale_events");
            let events = match self.client.sale_events(from, to).await {
                Ok(events) => events,
                Err(e) => {
                    self.note_source_error(env, "sale_events", &(from, to), &e);
                    break;
                }
            };

            let mut ds = self.dataset.write().await;
            let mut found = 0usize;
            for event in events {
                let SaleEventKind::ReleasePurchased { release_id, buyer, quantity } = event.kind else {
                    continue;
                };
                let release = ds.release(release_id);
                let sale = ReleaseSaleRecord {
                    release_id,
                    buyer,
                    quantity,
                    block_number: event.block_number,
                    tx_hash: event.tx_hash,
                    price: release.map(|r| r.price),
                    payment_token: release.map(|r| r.payment_token),
                };
                ds.release_sales.push(sale);
                found += 1;
            }
            ds.last_scanned_block = Some(to);
            drop(ds);

            env.services.metrics.record_scan_cursor(&self.config.name, to);
            debug!(
                "[{}] scanned blocks {}..={} ({} release sales), head {}",
                self.config.name, from, to, found, head
            );
            cursor = to;
            scanned += window;
        }
        StageResult::Completed
    }
}
