//! Cached marketplace entities.
//!
//! Every record here is owned by exactly one [`ChainDataset`]. Identity fields are
//! set once when the record is first fetched; [`Cached::update_from`] only touches the
//! fields the marketplace contracts are allowed to change.

use crate::cache_aside::Cached;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Listing is open for buys and offers.
pub const SALE_STATE_OPEN: u8 = 0;
/// Listing was closed (sold or cancelled) on-chain.
pub const SALE_STATE_CLOSED: u8 = 1;

/// Stages of a full synchronization pass, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    Counts,
    Listings,
    Collections,
    Releases,
    TokenPrices,
    SaleCollections,
    ReleaseSales,
    ListingCollections,
    IpfsPins,
}

impl SyncStage {
    pub const ALL: [SyncStage; 9] = [
        SyncStage::Counts,
        SyncStage::Listings,
        SyncStage::Collections,
        SyncStage::Releases,
        SyncStage::TokenPrices,
        SyncStage::SaleCollections,
        SyncStage::ReleaseSales,
        SyncStage::ListingCollections,
        SyncStage::IpfsPins,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Counts => "counts",
            SyncStage::Listings => "listings",
            SyncStage::Collections => "collections",
            SyncStage::Releases => "releases",
            SyncStage::TokenPrices => "token_prices",
            SyncStage::SaleCollections => "sale_collections",
            SyncStage::ReleaseSales => "release_sales",
            SyncStage::ListingCollections => "listing_collections",
            SyncStage::IpfsPins => "ipfs_pins",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-pass progress markers. Reset at pass start, set when a stage completes uncancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    pub counts: bool,
    pub listings: bool,
    pub collections: bool,
    pub releases: bool,
    pub token_prices: bool,
    pub sale_collections: bool,
    pub release_sales: bool,
    pub listing_collections: bool,
    pub ipfs_pins: bool,
}

impl StageFlags {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn slot(&mut self, stage: SyncStage) -> &mut bool {
        match stage {
            SyncStage::Counts => &mut self.counts,
            SyncStage::Listings => &mut self.listings,
            SyncStage::Collections => &mut self.collections,
            SyncStage::Releases => &mut self.releases,
            SyncStage::TokenPrices => &mut self.token_prices,
            SyncStage::SaleCollections => &mut self.sale_collections,
            SyncStage::ReleaseSales => &mut self.release_sales,
            SyncStage::ListingCollections => &mut self.listing_collections,
            SyncStage::IpfsPins => &mut self.ipfs_pins,
        }
    }

    pub fn mark(&mut self, stage: SyncStage) {
        *self.slot(stage) = true;
    }

    pub fn is_set(&self, stage: SyncStage) -> bool {
        match stage {
            SyncStage::Counts => self.counts,
            SyncStage::Listings => self.listings,
            SyncStage::Collections => self.collections,
            SyncStage::Releases => self.releases,
            SyncStage::TokenPrices => self.token_prices,
            SyncStage::SaleCollections => self.sale_collections,
            SyncStage::ReleaseSales => self.release_sales,
            SyncStage::ListingCollections => self.listing_collections,
            SyncStage::IpfsPins => self.ipfs_pins,
        }
    }

    pub fn all_set(&self) -> bool {
        SyncStage::ALL.iter().all(|s| self.is_set(*s))
    }
}

/// Everything cached for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDataset {
    pub chain: String,
    pub chain_id: u64,
    /// Authoritative listing count per marketplace version.
    pub total_listings: BTreeMap<u32, u64>,
    pub total_collections: u64,
    pub total_releases: u64,
    /// Last block already scanned for release sales.
    pub last_scanned_block: Option<u64>,
    #[serde(default)]
    pub updated: StageFlags,
    #[serde(default)]
    pub last_sync_duration_ms: u64,
    #[serde(default)]
    pub last_sync_completed: bool,
    #[serde(default)]
    pub bootstrap_completed: bool,
    #[serde(default)]
    pub listings: Vec<ListingRecord>,
    #[serde(default)]
    pub collections: Vec<CollectionRecord>,
    #[serde(default)]
    pub releases: Vec<ReleaseRecord>,
    #[serde(default)]
    pub nfts: Vec<NftRecord>,
    #[serde(default)]
    pub release_sales: Vec<ReleaseSaleRecord>,
}

impl ChainDataset {
    pub fn new(chain: impl Into<String>, chain_id: u64, versions: &[u32]) -> Self {
        Self {
            chain: chain.into(),
            chain_id,
            total_listings: versions.iter().map(|v| (*v, 0)).collect(),
            total_collections: 0,
            total_releases: 0,
            last_scanned_block: None,
            updated: StageFlags::default(),
            last_sync_duration_ms: 0,
            last_sync_completed: false,
            bootstrap_completed: false,
            listings: Vec::new(),
            collections: Vec::new(),
            releases: Vec::new(),
            nfts: Vec::new(),
            release_sales: Vec::new(),
        }
    }

    pub fn listing(&self, version: u32, id: u64) -> Option<&ListingRecord> {
        self.listings.iter().find(|l| l.version == version && l.id == id)
    }

    pub fn listing_mut(&mut self, version: u32, id: u64) -> Option<&mut ListingRecord> {
        self.listings.iter_mut().find(|l| l.version == version && l.id == id)
    }

    pub fn cached_listing_count(&self, version: u32) -> u64 {
        self.listings.iter().filter(|l| l.version == version).count() as u64
    }

    pub fn nft(&self, address: Address) -> Option<&NftRecord> {
        self.nfts.iter().find(|n| n.address == address)
    }

    pub fn nft_mut(&mut self, address: Address) -> Option<&mut NftRecord> {
        self.nfts.iter_mut().find(|n| n.address == address)
    }

    pub fn release(&self, id: u64) -> Option<&ReleaseRecord> {
        self.releases.iter().find(|r| r.id == id)
    }

    /// Collection whose member list contains `nft`, first match wins.
    pub fn collection_for_nft(&self, nft: Address) -> Option<&CollectionRecord> {
        self.collections.iter().find(|c| c.nft_addresses.contains(&nft))
    }
}

/// Reference to one offer of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRef {
    pub payment_token: Address,
    pub offer_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub version: u32,
    pub id: u64,
    pub owner: Address,
    pub payment_token: Address,
    pub nft_address: Address,
    pub token_id: U256,
    pub min_price: U256,
    pub max_price: U256,
    pub start_time: u64,
    pub end_time: u64,
    pub created_block: u64,
    pub closed_block: u64,
    pub sale_state: u8,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    pub was_sold: bool,
    #[serde(default)]
    pub top_offer: Option<OfferRef>,
    #[serde(default)]
    pub tx_hash: Option<H256>,
    #[serde(default)]
    pub sale: Option<SaleRecord>,
    #[serde(default)]
    pub collection_id: Option<u64>,
    #[serde(default)]
    pub collection_name: Option<String>,
    pub last_retrieved: DateTime<Utc>,
    #[serde(default)]
    pub offers: Vec<OfferRecord>,
}

impl ListingRecord {
    pub fn is_open(&self) -> bool {
        self.sale_state == SALE_STATE_OPEN
    }

    pub fn offers_for(&self, token: Address) -> impl Iterator<Item = &OfferRecord> {
        self.offers.iter().filter(move |o| o.payment_token == token)
    }

    pub fn offer(&self, top: &OfferRef) -> Option<&OfferRecord> {
        self.offers
            .iter()
            .find(|o| o.payment_token == top.payment_token && o.offer_id == top.offer_id)
    }
}

impl Cached for ListingRecord {
    type Key = (u32, u64);

    fn key(&self) -> Self::Key {
        (self.version, self.id)
    }

    fn last_retrieved(&self) -> DateTime<Utc> {
        self.last_retrieved
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_retrieved = at;
    }

    fn update_from(&mut self, fresh: Self) {
        self.min_price = fresh.min_price;
        self.max_price = fresh.max_price;
        self.start_time = fresh.start_time;
        self.end_time = fresh.end_time;
        self.closed_block = fresh.closed_block;
        self.sale_state = fresh.sale_state;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub payment_token: Address,
    pub offer_id: u64,
    pub offeror: Address,
    pub amount: U256,
    pub discount: U256,
    pub claimed: bool,
    pub created_block: u64,
    pub end_block: u64,
    pub last_retrieved: DateTime<Utc>,
}

impl Cached for OfferRecord {
    type Key = (Address, u64);

    fn key(&self) -> Self::Key {
        (self.payment_token, self.offer_id)
    }

    fn last_retrieved(&self) -> DateTime<Utc> {
        self.last_retrieved
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_retrieved = at;
    }

    fn update_from(&mut self, fresh: Self) {
        self.amount = fresh.amount;
        self.discount = fresh.discount;
        self.claimed = fresh.claimed;
        self.end_block = fresh.end_block;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: u64,
    pub owner: Address,
    pub treasury: Address,
    pub royalty_bps: u32,
    pub name: String,
    pub nft_addresses: Vec<Address>,
    pub last_retrieved: DateTime<Utc>,
}

impl Cached for CollectionRecord {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }

    fn last_retrieved(&self) -> DateTime<Utc> {
        self.last_retrieved
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_retrieved = at;
    }

    fn update_from(&mut self, fresh: Self) {
        self.treasury = fresh.treasury;
        self.royalty_bps = fresh.royalty_bps;
        self.name = fresh.name;
        self.nft_addresses = fresh.nft_addresses;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: u64,
    pub owner: Address,
    pub nft_address: Address,
    pub treasury: Address,
    pub payment_token: Address,
    pub price: U256,
    pub sold: u64,
    pub max_supply: u64,
    pub end_date: u64,
    pub whitelist_only: bool,
    pub ended: bool,
    pub last_retrieved: DateTime<Utc>,
}

impl Cached for ReleaseRecord {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }

    fn last_retrieved(&self) -> DateTime<Utc> {
        self.last_retrieved
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_retrieved = at;
    }

    fn update_from(&mut self, fresh: Self) {
        self.payment_token = fresh.payment_token;
        self.price = fresh.price;
        self.sold = fresh.sold;
        self.end_date = fresh.end_date;
        self.whitelist_only = fresh.whitelist_only;
        self.ended = fresh.ended;
    }
}

/// Cached image pair for an NFT contract or token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRefs {
    pub high_res: String,
    pub low_res: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftTokenEntry {
    pub token_id: U256,
    pub uri: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub images: Option<ImageRefs>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftRecord {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub uri: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub images: Option<ImageRefs>,
    #[serde(default)]
    pub tokens: Vec<NftTokenEntry>,
    pub last_retrieved: DateTime<Utc>,
}

impl NftRecord {
    pub fn token(&self, token_id: U256) -> Option<&NftTokenEntry> {
        self.tokens.iter().find(|t| t.token_id == token_id)
    }
}

impl Cached for NftRecord {
    type Key = Address;

    fn key(&self) -> Address {
        self.address
    }

    fn last_retrieved(&self) -> DateTime<Utc> {
        self.last_retrieved
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_retrieved = at;
    }

    fn update_from(&mut self, fresh: Self) {
        self.name = fresh.name;
        self.symbol = fresh.symbol;
        self.uri = fresh.uri;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleKind {
    DirectBuy,
    AcceptedOffer,
}

/// Completed sale of a listing. Written once by finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub kind: SaleKind,
    pub buyer: Address,
    pub seller: Address,
    pub amount: U256,
    pub payment_token: Address,
    pub usd_value: f64,
    pub created_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
    pub block_number: u64,
    pub tx_hash: H256,
}

/// Purchase from a release, discovered by the block scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSaleRecord {
    pub release_id: u64,
    pub buyer: Address,
    pub quantity: u64,
    pub block_number: u64,
    pub tx_hash: H256,
    pub price: Option<U256>,
    pub payment_token: Option<Address>,
}

/// Price of one oracle token, shared across chains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceCacheEntry {
    pub usd: f64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_flags_mark_and_reset() {
        let mut flags = StageFlags::default();
        assert!(!flags.all_set());
        for stage in SyncStage::ALL {
            flags.mark(stage);
        }
        assert!(flags.all_set());
        assert!(flags.is_set(SyncStage::ReleaseSales));
        flags.reset();
        assert!(!flags.is_set(SyncStage::Counts));
    }

    #[test]
    fn test_collection_for_nft_first_match() {
        let nft = Address::from_low_u64_be(0xabc);
        let mut ds = ChainDataset::new("testnet", 1, &[1, 2]);
        for (id, name) in [(0u64, "first"), (1, "second")] {
            ds.collections.push(CollectionRecord {
                id,
                owner: Address::zero(),
                treasury: Address::zero(),
                royalty_bps: 0,
                name: name.to_string(),
                nft_addresses: vec![nft],
                last_retrieved: Utc::now(),
            });
        }
        assert_eq!(ds.collection_for_nft(nft).map(|c| c.id), Some(0));
        assert!(ds.collection_for_nft(Address::zero()).is_none());
        assert_eq!(ds.total_listings.get(&2), Some(&0));
    }
}
