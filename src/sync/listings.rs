//! Listings stage, offer refresh, top-offer selection and finalization.

use super::{ChainSync, StageResult, SyncContext, SyncEnv};
use crate::chain_client::{SaleEvent, SaleEventKind};
use crate::models::{ListingRecord, OfferRecord, OfferRef, SaleKind, SaleRecord};
use crate::price_oracle::usd_value;
use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Address, U256};
use log::{debug, info};

/// Highest USD value wins; an equal value seen later does not replace it.
pub fn select_top_offer<I>(candidates: I) -> Option<OfferRef>
where
    I: IntoIterator<Item = (OfferRef, f64)>,
{
    let mut best: Option<(OfferRef, f64)> = None;
    for (offer, usd) in candidates {
        if !usd.is_finite() {
            continue;
        }
        match best {
            Some((_, top)) if usd <= top => {}
            _ => best = Some((offer, usd)),
        }
    }
    best.map(|(offer, _)| offer)
}

/// An offer claimed while its listing is still open can no longer be accepted.
fn is_eligible(listing: &ListingRecord, offer: &OfferRecord) -> bool {
    !(offer.claimed && listing.is_open())
}

impl ChainSync {
    pub(crate) async fn retrieve_listing(
        &self,
        env: &SyncEnv,
        version: u32,
        id: u64,
        force: bool,
    ) -> Option<ListingRecord> {
        self.retrieve_cached(
            env,
            "listing",
            &(version, id),
            force,
            |ds| Some(&ds.listings),
            |ds| Some(&mut ds.listings),
            || self.client.listing(version, id),
        )
        .await
    }

    /// Offers live inside their listing; a listing that is not cached has none.
    pub(crate) async fn retrieve_offer(
        &self,
        env: &SyncEnv,
        version: u32,
        listing_id: u64,
        token: Address,
        offer_id: u64,
        force: bool,
    ) -> Option<OfferRecord> {
        self.retrieve_cached(
            env,
            "offer",
            &(token, offer_id),
            force,
            |ds| ds.listing(version, listing_id).map(|l| &l.offers),
            |ds| ds.listing_mut(version, listing_id).map(|l| &mut l.offers),
            || self.client.offer(version, listing_id, token, offer_id),
        )
        .await
    }

    pub(crate) async fn sync_listings(&self, env: &SyncEnv, ctx: &SyncContext) -> StageResult {
        let open = self.unfinalized_listings().await;
        for (version, id) in open {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            self.retrieve_listing(env, version, id, true).await;
        }

        for version in self.config.versions() {
            let (cached, total) = {
                let ds = self.dataset.read().await;
                let total = ds.total_listings.get(&version).copied().unwrap_or(0);
                (ds.cached_listing_count(version), total)
            };
            if total > cached {
                info!("[{}] fetching {} new v{} listings", self.config.name, total - cached, version);
            }
            for id in cached..total {
                if ctx.is_cancelled() {
                    return StageResult::Cancelled;
                }
                self.retrieve_listing(env, version, id, false).await;
            }
        }

        let open: Vec<(u32, u64, Address, U256)> = {
            let ds = self.dataset.read().await;
            ds.listings
                .iter()
                .filter(|l| !l.finalized)
                .map(|l| (l.version, l.id, l.nft_address, l.token_id))
                .collect()
        };
        for (version, id, nft, token_id) in open {
            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            if self.retrieve_nft(env, nft, false).await.is_some() {
                let missing_token = {
                    let ds = self.dataset.read().await;
                    ds.nft(nft).map_or(false, |n| n.token(token_id).is_none())
                };
                if missing_token {
                    self.retrieve_nft_token(env, nft, token_id, false).await;
                }
            }
            if self.listing_details(env, ctx, version, id).await == StageResult::Cancelled {
                return StageResult::Cancelled;
            }
        }
        StageResult::Completed
    }

    async fn unfinalized_listings(&self) -> Vec<(u32, u64)> {
        let ds = self.dataset.read().await;
        ds.listings
            .iter()
            .filter(|l| !l.finalized)
            .map(|l| (l.version, l.id))
            .collect()
    }

    /// Offers, top offer and finalization for one listing.
    ///
    /// Top-offer candidates are the offers refreshed or discovered here. An offer
    /// that was already claimed before this pass is never refreshed again, so it
    /// cannot come back as a candidate once its listing closes.
    pub(crate) async fn listing_details(
        &self,
        env: &SyncEnv,
        ctx: &SyncContext,
        version: u32,
        id: u64,
    ) -> StageResult {
        let Some(listing) = self.dataset.read().await.listing(version, id).cloned() else {
            return StageResult::Completed;
        };
        let mut candidates: Vec<(OfferRef, U256, usize)> = Vec::new();
        let mut keep = |offer: Option<OfferRecord>, idx: usize| {
            if let Some(o) = offer.filter(|o| is_eligible(&listing, o)) {
                let offer = OfferRef { payment_token: o.payment_token, offer_id: o.offer_id };
                candidates.push((offer, o.amount, idx));
            }
        };

        for (idx, token) in self.config.payment_tokens.iter().enumerate() {
            let known: Vec<u64> = listing
                .offers_for(token.address)
                .filter(|o| !o.claimed)
                .map(|o| o.offer_id)
                .collect();
            for offer_id in known {
                if ctx.is_cancelled() {
                    return StageResult::Cancelled;
                }
                keep(self.retrieve_offer(env, version, id, token.address, offer_id, true).await, idx);
            }

            if ctx.is_cancelled() {
                return StageResult::Cancelled;
            }
            env.services.metrics.record_fetch("offer_count");
            let total = match self.client.total_offers(version, id, token.address).await {
                Ok(Some(n)) => n,
                Ok(None) => 0,
                Err(e) => {
                    self.note_source_error(env, "offer_count", &(version, id, token.address), &e);
                    continue;
                }
            };
            let cached = {
                let ds = self.dataset.read().await;
                ds.listing(version, id)
                    .map(|l| l.offers_for(token.address).count() as u64)
                    .unwrap_or(0)
            };
            for offer_id in cached..total {
                if ctx.is_cancelled() {
                    return StageResult::Cancelled;
                }
                keep(self.retrieve_offer(env, version, id, token.address, offer_id, false).await, idx);
            }
        }

        self.update_top_offer(env, version, id, candidates).await;

        if ctx.is_cancelled() {
            return StageResult::Cancelled;
        }
        self.try_finalize(env, version, id).await;
        StageResult::Completed
    }

    async fn update_top_offer(
        &self,
        env: &SyncEnv,
        version: u32,
        id: u64,
        eligible: Vec<(OfferRef, U256, usize)>,
    ) {
        let mut candidates = Vec::with_capacity(eligible.len());
        for (offer, amount, idx) in eligible {
            let token = &self.config.payment_tokens[idx];
            let price = env.services.prices.usd_price(&token.price_key).await.unwrap_or(0.0);
            candidates.push((offer, usd_value(amount, token.decimals, price)));
        }
        let top = select_top_offer(candidates);

        let mut ds = self.dataset.write().await;
        if let Some(listing) = ds.listing_mut(version, id) {
            listing.top_offer = top;
        }
    }

    /// Look for the event that closed the listing. Not finding one leaves the
    /// listing unfinalized so the next pass tries again.
    async fn try_finalize(&self, env: &SyncEnv, version: u32, id: u64) {
        let (closed_block, created_block, owner) = {
            let ds = self.dataset.read().await;
            match ds.listing(version, id) {
                Some(l) if !l.is_open() && !l.finalized => (l.closed_block, l.created_block, l.owner),
                _ => return,
            }
        };

        self.log_throttle.wait().await;
        env.services.metrics.record_fetch("sale_events");
        let events = match self.client.sale_events(closed_block, closed_block).await {
            Ok(events) => events,
            Err(e) => {
                self.note_source_error(env, "sale_events", &(closed_block, closed_block), &e);
                return;
            }
        };
        let Some(event) = events.into_iter().find(|e| e.listing() == Some((version, id))) else {
            debug!(
                "[{}] listing {}:{} closed at block {} without a sale event, retrying next pass",
                self.config.name, version, id, closed_block
            );
            return;
        };

        let settlement = match &event.kind {
            SaleEventKind::DirectBuy { buyer, amount, payment_token, .. } => {
                Some((SaleKind::DirectBuy, *buyer, *amount, *payment_token))
            }
            SaleEventKind::OfferAccepted { offeror, amount, payment_token, .. } => {
                Some((SaleKind::AcceptedOffer, *offeror, *amount, *payment_token))
            }
            SaleEventKind::ListingCancelled { .. } | SaleEventKind::ReleasePurchased { .. } => None,
        };
        let sale = match settlement {
            Some((kind, buyer, amount, payment_token)) => Some(
                self.build_sale(env, kind, buyer, owner, amount, payment_token, created_block, &event)
                    .await,
            ),
            None => None,
        };

        let mut ds = self.dataset.write().await;
        let Some(listing) = ds.listing_mut(version, id) else {
            return;
        };
        if listing.finalized {
            return;
        }
        listing.finalized = true;
        listing.tx_hash = Some(event.tx_hash);
        let sold = sale.is_some();
        if let Some(sale) = sale {
            listing.was_sold = true;
            listing.sale = Some(sale);
        }
        info!(
            "[{}] finalized listing {}:{} ({})",
            self.config.name,
            version,
            id,
            if sold { "sold" } else { "cancelled" }
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_sale(
        &self,
        env: &SyncEnv,
        kind: SaleKind,
        buyer: Address,
        seller: Address,
        amount: U256,
        payment_token: Address,
        created_block: u64,
        event: &SaleEvent,
    ) -> SaleRecord {
        let created_at = self.block_time(env, created_block).await;
        let sold_at = self.block_time(env, event.block_number).await;

        let usd = match (self.config.payment_token(payment_token), sold_at) {
            (Some(token), Some(at)) => {
                let prices = &env.services.prices;
                let date = at.date_naive();
                let price = match prices.cached_historical(&token.price_key, date) {
                    Some(price) => Some(price),
                    None => {
                        self.price_throttle.wait().await;
                        prices.historical_usd_price(&token.price_key, date).await
                    }
                };
                price.map(|price| usd_value(amount, token.decimals, price)).unwrap_or(0.0)
            }
            _ => 0.0,
        };

        SaleRecord {
            kind,
            buyer,
            seller,
            amount,
            payment_token,
            usd_value: usd,
            created_at,
            sold_at,
            block_number: event.block_number,
            tx_hash: event.tx_hash,
        }
    }

    async fn block_time(&self, env: &SyncEnv, block: u64) -> Option<DateTime<Utc>> {
        env.services.metrics.record_fetch("block");
        match self.client.block_timestamp(block).await {
            Ok(Some(ts)) => Utc.timestamp_opt(ts as i64, 0).single(),
            Ok(None) => {
                env.services.metrics.record_not_found("block");
                None
            }
            Err(e) => {
                self.note_source_error(env, "block", &block, &e);
                None
            }
        }
    }
}
