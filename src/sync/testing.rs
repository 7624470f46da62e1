//! In-memory collaborators for exercising the engine without a node, an oracle or
//! an asset server. Every mock counts its calls so tests can assert on traffic.

use crate::assets::{AssetCache, Pinner};
use crate::chain_client::{ChainClient, SaleEvent, SaleEventKind, SourceResult};
use crate::error::{PersistenceError, SourceError};
use crate::metrics::SyncMetrics;
use crate::models::{
    ChainDataset, CollectionRecord, ImageRefs, ListingRecord, NftRecord, OfferRecord, ReleaseRecord,
    SALE_STATE_OPEN,
};
use crate::persistence::SnapshotStore;
use crate::price_oracle::{PriceBook, PriceOracle, PriceResult};
use crate::settings::{ChainConfig, PaymentToken};
use crate::sync::SyncServices;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ethers::types::{Address, H160, H256, U256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub const PAYMENT_TOKEN: Address = H160([0x55; 20]);
pub const PRICE_KEY: &str = "weth";

/// Chain config with both marketplace versions and one 18-decimals payment token.
pub fn chain_config(name: &str) -> ChainConfig {
    ChainConfig {
        name: name.to_string(),
        chain_id: 1,
        rpc_url: "http://127.0.0.1:8545".to_string(),
        rpc_timeout_ms: 1000,
        marketplace_v1: Some(Address::repeat_byte(0x11)),
        marketplace_v2: Some(Address::repeat_byte(0x22)),
        collections: Address::repeat_byte(0x33),
        releases: Address::repeat_byte(0x44),
        start_block: 1,
        payment_tokens: vec![PaymentToken {
            address: PAYMENT_TOKEN,
            price_key: PRICE_KEY.to_string(),
            decimals: 18,
        }],
    }
}

pub fn listing(version: u32, id: u64) -> ListingRecord {
    ListingRecord {
        version,
        id,
        owner: Address::repeat_byte(0x0a),
        payment_token: PAYMENT_TOKEN,
        nft_address: Address::repeat_byte(0x0b),
        token_id: U256::from(id),
        min_price: U256::exp10(18),
        max_price: U256::exp10(18),
        start_time: 1_700_000_000,
        end_time: 1_800_000_000,
        created_block: 10,
        closed_block: 0,
        sale_state: SALE_STATE_OPEN,
        finalized: false,
        was_sold: false,
        top_offer: None,
        tx_hash: None,
        sale: None,
        collection_id: None,
        collection_name: None,
        last_retrieved: Utc::now(),
        offers: Vec::new(),
    }
}

pub fn offer(token: Address, offer_id: u64, amount: U256) -> OfferRecord {
    OfferRecord {
        payment_token: token,
        offer_id,
        offeror: Address::from_low_u64_be(0x1000 + offer_id),
        amount,
        discount: U256::zero(),
        claimed: false,
        created_block: 20,
        end_block: 1_000_000,
        last_retrieved: Utc::now(),
    }
}

pub fn collection(id: u64, name: &str, nfts: Vec<Address>) -> CollectionRecord {
    CollectionRecord {
        id,
        owner: Address::repeat_byte(0x0c),
        treasury: Address::repeat_byte(0x0d),
        royalty_bps: 250,
        name: name.to_string(),
        nft_addresses: nfts,
        last_retrieved: Utc::now(),
    }
}

pub fn release(id: u64, price: U256) -> ReleaseRecord {
    ReleaseRecord {
        id,
        owner: Address::repeat_byte(0x0e),
        nft_address: Address::repeat_byte(0x0f),
        treasury: Address::repeat_byte(0x0d),
        payment_token: PAYMENT_TOKEN,
        price,
        sold: 0,
        max_supply: 100,
        end_date: 1_800_000_000,
        whitelist_only: false,
        ended: false,
        last_retrieved: Utc::now(),
    }
}

pub fn nft(address: Address, uri: Option<&str>) -> NftRecord {
    NftRecord {
        address,
        name: "Test NFT".to_string(),
        symbol: "TNFT".to_string(),
        uri: uri.map(str::to_string),
        metadata: None,
        images: None,
        tokens: Vec::new(),
        last_retrieved: Utc::now(),
    }
}

/// Authoritative chain state served by [`MockChainClient`].
#[derive(Default)]
pub struct MockChainState {
    pub total_listings: BTreeMap<u32, u64>,
    pub listings: HashMap<(u32, u64), ListingRecord>,
    pub offers: HashMap<(u32, u64, Address), Vec<OfferRecord>>,
    pub collections: BTreeMap<u64, CollectionRecord>,
    pub releases: BTreeMap<u64, ReleaseRecord>,
    pub nfts: HashMap<Address, NftRecord>,
    pub token_uris: HashMap<(Address, U256), String>,
    /// Successive head heights; the last one repeats.
    pub heads: VecDeque<u64>,
    pub events: Vec<SaleEvent>,
    /// Every `sale_events` query fails while set.
    pub fail_sale_events: bool,
    /// Every call fails with a timeout while set.
    pub offline: bool,
    /// Simulated node round trip for `listing` calls.
    pub listing_latency: Option<Duration>,
}

#[derive(Default)]
pub struct MockChainClient {
    state: Mutex<MockChainState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    event_queries: Mutex<Vec<(u64, u64)>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F: FnOnce(&mut MockChainState)>(&self, f: F) {
        f(&mut lock(&self.state));
    }

    pub fn set_total_listings(&self, version: u32, total: u64) {
        self.update(|s| {
            s.total_listings.insert(version, total);
        });
    }

    pub fn put_listing(&self, record: ListingRecord) {
        self.update(|s| {
            s.listings.insert((record.version, record.id), record);
        });
    }

    pub fn put_offer(&self, version: u32, listing_id: u64, record: OfferRecord) {
        self.update(|s| {
            let offers = s.offers.entry((version, listing_id, record.payment_token)).or_default();
            offers.retain(|o| o.offer_id != record.offer_id);
            offers.push(record);
            offers.sort_by_key(|o| o.offer_id);
        });
    }

    pub fn put_collection(&self, record: CollectionRecord) {
        self.update(|s| {
            s.collections.insert(record.id, record);
        });
    }

    pub fn put_release(&self, record: ReleaseRecord) {
        self.update(|s| {
            s.releases.insert(record.id, record);
        });
    }

    pub fn put_nft(&self, record: NftRecord) {
        self.update(|s| {
            s.nfts.insert(record.address, record);
        });
    }

    pub fn put_token_uri(&self, address: Address, token_id: U256, uri: &str) {
        self.update(|s| {
            s.token_uris.insert((address, token_id), uri.to_string());
        });
    }

    pub fn set_heads(&self, heads: &[u64]) {
        self.update(|s| s.heads = heads.iter().copied().collect());
    }

    pub fn push_event(&self, event: SaleEvent) {
        self.update(|s| s.events.push(event));
    }

    pub fn calls(&self, method: &str) -> usize {
        lock(&self.calls).get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
        lock(&self.event_queries).clear();
    }

    /// Ranges passed to `sale_events`, in call order.
    pub fn event_queries(&self) -> Vec<(u64, u64)> {
        lock(&self.event_queries).clone()
    }

    fn hit(&self, method: &'static str) -> Result<MutexGuard<'_, MockChainState>, SourceError> {
        *lock(&self.calls).entry(method).or_insert(0) += 1;
        let state = lock(&self.state);
        if state.offline {
            return Err(SourceError::Timeout);
        }
        Ok(state)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn total_listings(&self, version: u32) -> SourceResult<u64> {
        Ok(self.hit("total_listings")?.total_listings.get(&version).copied())
    }

    async fn listing(&self, version: u32, id: u64) -> SourceResult<ListingRecord> {
        let latency = lock(&self.state).listing_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.hit("listing")?.listings.get(&(version, id)).cloned().map(|mut l| {
            l.last_retrieved = Utc::now();
            l
        }))
    }

    async fn total_offers(&self, version: u32, listing_id: u64, token: Address) -> SourceResult<u64> {
        let state = self.hit("total_offers")?;
        Ok(Some(state.offers.get(&(version, listing_id, token)).map_or(0, |o| o.len() as u64)))
    }

    async fn offer(&self, version: u32, listing_id: u64, token: Address, offer_id: u64) -> SourceResult<OfferRecord> {
        let state = self.hit("offer")?;
        Ok(state
            .offers
            .get(&(version, listing_id, token))
            .and_then(|offers| offers.iter().find(|o| o.offer_id == offer_id))
            .cloned())
    }

    async fn total_collections(&self) -> SourceResult<u64> {
        Ok(Some(self.hit("total_collections")?.collections.len() as u64))
    }

    async fn collection(&self, id: u64) -> SourceResult<CollectionRecord> {
        Ok(self.hit("collection")?.collections.get(&id).cloned())
    }

    async fn total_releases(&self) -> SourceResult<u64> {
        Ok(Some(self.hit("total_releases")?.releases.len() as u64))
    }

    async fn release(&self, id: u64) -> SourceResult<ReleaseRecord> {
        Ok(self.hit("release")?.releases.get(&id).cloned())
    }

    async fn nft_details(&self, address: Address) -> SourceResult<NftRecord> {
        Ok(self.hit("nft_details")?.nfts.get(&address).cloned())
    }

    async fn token_uri(&self, address: Address, token_id: U256) -> SourceResult<String> {
        Ok(self.hit("token_uri")?.token_uris.get(&(address, token_id)).cloned())
    }

    async fn block_number(&self) -> Result<u64, SourceError> {
        let mut state = self.hit("block_number")?;
        let head = if state.heads.len() > 1 {
            state.heads.pop_front()
        } else {
            state.heads.front().copied()
        };
        Ok(head.unwrap_or(0))
    }

    async fn sale_events(&self, from_block: u64, to_block: u64) -> Result<Vec<SaleEvent>, SourceError> {
        lock(&self.event_queries).push((from_block, to_block));
        let state = self.hit("sale_events")?;
        if state.fail_sale_events {
            return Err(SourceError::Transport("log query failed".to_string()));
        }
        Ok(state
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block: u64) -> SourceResult<u64> {
        self.hit("block_timestamp")?;
        Ok(Some(1_700_000_000 + block * 2))
    }
}

/// Fixed prices per token key. Unknown keys are not found.
#[derive(Default)]
pub struct MockPriceOracle {
    prices: Mutex<HashMap<String, f64>>,
    historical: Mutex<HashMap<String, f64>>,
    calls: Mutex<usize>,
}

impl MockPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, key: &str, usd: f64) -> Self {
        lock(&self.prices).insert(key.to_string(), usd);
        lock(&self.historical).insert(key.to_string(), usd);
        self
    }

    pub fn set_price(&self, key: &str, usd: f64) {
        lock(&self.prices).insert(key.to_string(), usd);
    }

    pub fn set_historical_price(&self, key: &str, usd: f64) {
        lock(&self.historical).insert(key.to_string(), usd);
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn current_usd_price(&self, token_key: &str) -> PriceResult {
        *lock(&self.calls) += 1;
        Ok(lock(&self.prices).get(token_key).copied())
    }

    async fn historical_usd_price(&self, token_key: &str, _date: NaiveDate) -> PriceResult {
        *lock(&self.calls) += 1;
        Ok(lock(&self.historical).get(token_key).copied())
    }
}

/// Serves metadata documents from a map and "caches" images under a fixed prefix.
pub struct MockAssetCache {
    base_url: String,
    documents: Mutex<HashMap<String, serde_json::Value>>,
    metadata_calls: Mutex<usize>,
    image_calls: Mutex<usize>,
}

impl Default for MockAssetCache {
    fn default() -> Self {
        Self {
            base_url: "https://assets.test/cache/".to_string(),
            documents: Mutex::new(HashMap::new()),
            metadata_calls: Mutex::new(0),
            image_calls: Mutex::new(0),
        }
    }
}

impl MockAssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_metadata(&self, uri: &str, document: serde_json::Value) {
        lock(&self.documents).insert(uri.to_string(), document);
    }

    pub fn metadata_calls(&self) -> usize {
        *lock(&self.metadata_calls)
    }

    pub fn image_calls(&self) -> usize {
        *lock(&self.image_calls)
    }
}

#[async_trait]
impl AssetCache for MockAssetCache {
    async fn fetch_metadata(&self, uri: &str) -> Result<Option<serde_json::Value>, SourceError> {
        *lock(&self.metadata_calls) += 1;
        Ok(lock(&self.documents).get(uri).cloned())
    }

    async fn cache_image(
        &self,
        chain: &str,
        entity: Address,
        _source_uri: &str,
        token_id: Option<U256>,
        _force: bool,
    ) -> Result<Option<ImageRefs>, SourceError> {
        *lock(&self.image_calls) += 1;
        let name = token_id.map(|t| t.to_string()).unwrap_or_else(|| "contract".to_string());
        let high_res = format!("{}{}/{:?}/{}", self.base_url, chain, entity, name);
        Ok(Some(ImageRefs { low_res: format!("{}?size=thumb", high_res), high_res }))
    }

    fn is_managed(&self, reference: &str) -> bool {
        reference.starts_with(&self.base_url)
    }
}

/// Records every batch it is asked to pin.
#[derive(Default)]
pub struct RecordingPinner {
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingPinner {
    pub fn batches(&self) -> Vec<Vec<String>> {
        lock(&self.batches).clone()
    }
}

#[async_trait]
impl Pinner for RecordingPinner {
    async fn pin(&self, cids: &[String]) -> Result<usize, SourceError> {
        lock(&self.batches).push(cids.to_vec());
        Ok(cids.len())
    }
}

/// Snapshot store that keeps the last saved datasets in memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    saved: Mutex<Option<Vec<ChainDataset>>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn with_snapshot(datasets: Vec<ChainDataset>) -> Self {
        Self { saved: Mutex::new(Some(datasets)), saves: Mutex::new(0) }
    }

    pub fn saved(&self) -> Option<Vec<ChainDataset>> {
        lock(&self.saved).clone()
    }

    pub fn saves(&self) -> usize {
        *lock(&self.saves)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Vec<ChainDataset>>, PersistenceError> {
        Ok(lock(&self.saved).clone())
    }

    async fn save(&self, datasets: &[ChainDataset]) -> Result<(), PersistenceError> {
        *lock(&self.saved) = Some(datasets.to_vec());
        *lock(&self.saves) += 1;
        Ok(())
    }
}

/// Services wired to the given mocks, with a one-minute price TTL.
pub fn services(
    oracle: Arc<MockPriceOracle>,
    assets: Arc<MockAssetCache>,
    pinner: Option<Arc<RecordingPinner>>,
) -> SyncServices {
    let metrics = Arc::new(SyncMetrics::new());
    SyncServices {
        prices: Arc::new(PriceBook::new(oracle, Duration::from_secs(60), metrics.clone())),
        assets,
        pinner: pinner.map(|p| p as Arc<dyn Pinner>),
        metrics,
    }
}

/// A sale event at `block` with a deterministic transaction hash.
pub fn sale_event(block_number: u64, kind: SaleEventKind) -> SaleEvent {
    SaleEvent { block_number, tx_hash: H256::from_low_u64_be(block_number), kind }
}
