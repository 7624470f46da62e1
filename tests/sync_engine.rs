//! Integration tests for the sync engine
//!
//! Tests cover:
//! - Cache-aside freshness through the read layer
//! - Listing lifecycle: open, closed, finalized with a sale record
//! - Reads served while a node fetch is in flight
//! - Top-offer selection across a full pass
//! - Per-pass refresh rules for collections, releases and NFT images
//! - Release-sale block scan: failure resumability and a moving head
//! - Pass deadline, idempotence and snapshot handling

use ethers::types::{Address, U256};
use market_sync::chain_client::{ChainClient, SaleEventKind};
use market_sync::models::{ChainDataset, OfferRef, SaleKind, SALE_STATE_CLOSED};
use market_sync::persistence::{JsonFileStore, SnapshotStore};
use market_sync::settings::SyncSettings;
use market_sync::sync::testing::{
    self, MemorySnapshotStore, MockAssetCache, MockChainClient, MockPriceOracle, RecordingPinner, PAYMENT_TOKEN,
    PRICE_KEY,
};
use market_sync::sync::SyncEngine;
use market_sync::SyncError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CHAIN: &str = "testnet";

struct Harness {
    client: Arc<MockChainClient>,
    oracle: Arc<MockPriceOracle>,
    assets: Arc<MockAssetCache>,
    pinner: Arc<RecordingPinner>,
    store: Arc<MemorySnapshotStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            client: Arc::new(MockChainClient::new()),
            oracle: Arc::new(MockPriceOracle::new().with_price(PRICE_KEY, 1.0)),
            assets: Arc::new(MockAssetCache::new()),
            pinner: Arc::new(RecordingPinner::default()),
            store: Arc::new(MemorySnapshotStore::default()),
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings { throttle_delay_ms: 0, ..SyncSettings::default() }
    }

    fn engine(&self) -> SyncEngine {
        self.engine_with(Self::settings())
    }

    fn engine_with(&self, settings: SyncSettings) -> SyncEngine {
        let services = testing::services(self.oracle.clone(), self.assets.clone(), Some(self.pinner.clone()));
        let client: Arc<dyn ChainClient> = self.client.clone();
        SyncEngine::new(settings, vec![(testing::chain_config(CHAIN), client)], services, self.store.clone())
    }
}

fn ether(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

/// Dataset as JSON with every timestamp and duration blanked out.
fn normalized(ds: &ChainDataset) -> Value {
    fn strip(value: &mut Value) {
        match value {
            Value::Object(map) => {
                for key in ["last_retrieved", "last_sync_duration_ms"] {
                    if map.contains_key(key) {
                        map.insert(key.to_string(), Value::Null);
                    }
                }
                map.values_mut().for_each(strip);
            }
            Value::Array(items) => items.iter_mut().for_each(strip),
            _ => {}
        }
    }
    let mut value = serde_json::to_value(ds).unwrap();
    strip(&mut value);
    value
}

#[tokio::test]
async fn test_fresh_listing_served_without_refetch() {
    let h = Harness::new();
    h.client.put_listing(testing::listing(1, 0));
    let engine = h.engine();

    let first = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    let second = engine.listing(CHAIN, 1, 0, false).await.unwrap();

    assert_eq!(h.client.calls("listing"), 1);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_stale_listing_refetched_once() {
    let h = Harness::new();
    h.client.put_listing(testing::listing(1, 0));
    let engine = h.engine().with_cache_ttl(Duration::from_millis(20));

    let first = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = engine.listing(CHAIN, 1, 0, false).await.unwrap();

    assert_eq!(h.client.calls("listing"), 2);
    assert!(second.last_retrieved > first.last_retrieved);
}

#[tokio::test]
async fn test_failed_refresh_keeps_cached_value() {
    let h = Harness::new();
    h.client.put_listing(testing::listing(1, 0));
    let engine = h.engine();
    let cached = engine.listing(CHAIN, 1, 0, false).await.unwrap();

    h.client.update(|s| s.offline = true);
    let served = engine.listing(CHAIN, 1, 0, true).await.unwrap();

    assert_eq!(served, cached);
    let snap = engine.metrics().snapshot();
    assert_eq!(snap.source_errors, 1);
    assert_eq!(snap.timeouts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reads_not_blocked_by_slow_fetch() {
    let h = Harness::new();
    h.client.put_listing(testing::listing(1, 0));
    h.client.put_listing(testing::listing(1, 1));
    let engine = Arc::new(h.engine());
    engine.listing(CHAIN, 1, 0, false).await.unwrap();
    h.client.update(|s| s.listing_latency = Some(Duration::from_millis(500)));

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.listing(CHAIN, 1, 1, false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let open = engine.open_listings(CHAIN).await.unwrap();
    let cached = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(open.len(), 1);
    assert_eq!(cached.id, 0);

    assert_eq!(slow.await.unwrap().unwrap().id, 1);
    assert_eq!(engine.open_listings(CHAIN).await.unwrap().len(), 2);
    assert_eq!(h.client.calls("listing"), 2);
}

#[tokio::test]
async fn test_missing_entities_are_not_cached() {
    let h = Harness::new();
    let engine = h.engine();

    let err = engine.listing(CHAIN, 1, 42, false).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { kind: "listing", .. }));
    engine.listing(CHAIN, 1, 42, false).await.unwrap_err();
    assert_eq!(h.client.calls("listing"), 2);
    assert!(engine.dataset(CHAIN).await.unwrap().listings.is_empty());

    assert!(matches!(
        engine.release("mainnet", 0, false).await,
        Err(SyncError::UnknownChain(_))
    ));
}

#[tokio::test]
async fn test_listing_lifecycle_through_finalization() {
    let h = Harness::new();
    let oracle = Arc::new(MockPriceOracle::new().with_price(PRICE_KEY, 2000.0));
    let h = Harness { oracle, ..h };
    let buyer = Address::from_low_u64_be(0xb0b);
    h.client.set_total_listings(1, 1);
    h.client.set_total_listings(2, 0);
    h.client.put_listing(testing::listing(1, 0));
    h.client.set_heads(&[100]);
    let engine = h.engine();

    let report = engine.run_pass().await;
    assert!(report.incomplete_chains.is_empty());
    let open = engine.open_listings(CHAIN).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!((open[0].version, open[0].id), (1, 0));

    let mut closed = testing::listing(1, 0);
    closed.sale_state = SALE_STATE_CLOSED;
    closed.closed_block = 150;
    h.client.put_listing(closed);
    h.client.set_heads(&[200]);
    h.client.push_event(testing::sale_event(
        150,
        SaleEventKind::DirectBuy {
            version: 1,
            listing_id: 0,
            buyer,
            amount: ether(2),
            payment_token: PAYMENT_TOKEN,
        },
    ));
    engine.run_pass().await;

    let listing = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    assert!(listing.finalized);
    assert!(listing.was_sold);
    assert_eq!(listing.tx_hash, Some(ethers::types::H256::from_low_u64_be(150)));
    let sale = listing.sale.unwrap();
    assert_eq!(sale.kind, SaleKind::DirectBuy);
    assert_eq!(sale.buyer, buyer);
    assert_eq!(sale.seller, listing.owner);
    assert_eq!(sale.amount, ether(2));
    assert!((sale.usd_value - 4000.0).abs() < 1e-6);
    assert!(sale.sold_at.is_some() && sale.created_at.is_some());
    assert!(engine.open_listings(CHAIN).await.unwrap().is_empty());
    assert_eq!(engine.sold_listings(CHAIN).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_finalized_listing_is_never_revisited() {
    let h = Harness::new();
    h.client.set_total_listings(1, 1);
    let mut closed = testing::listing(1, 0);
    closed.sale_state = SALE_STATE_CLOSED;
    closed.closed_block = 30;
    h.client.put_listing(closed);
    h.client.push_event(testing::sale_event(30, SaleEventKind::ListingCancelled { version: 1, listing_id: 0 }));
    let engine = h.engine();

    engine.run_pass().await;
    let first = engine.dataset(CHAIN).await.unwrap().listings[0].clone();
    assert!(first.finalized);
    assert!(!first.was_sold);
    assert!(first.sale.is_none());

    // a later sale event for the same listing must not flip it
    h.client.push_event(testing::sale_event(
        30,
        SaleEventKind::DirectBuy {
            version: 1,
            listing_id: 0,
            buyer: Address::from_low_u64_be(1),
            amount: ether(1),
            payment_token: PAYMENT_TOKEN,
        },
    ));
    h.client.reset_calls();
    engine.run_pass().await;

    let second = engine.dataset(CHAIN).await.unwrap().listings[0].clone();
    assert_eq!(h.client.calls("listing"), 0);
    assert!(!second.was_sold);
    assert_eq!(second.tx_hash, first.tx_hash);
}

#[tokio::test]
async fn test_closed_listing_without_event_retries_every_pass() {
    let h = Harness::new();
    h.client.set_total_listings(1, 1);
    let mut closed = testing::listing(1, 0);
    closed.sale_state = SALE_STATE_CLOSED;
    closed.closed_block = 77;
    h.client.put_listing(closed);
    let engine = h.engine();

    engine.run_pass().await;
    engine.run_pass().await;

    assert!(!engine.dataset(CHAIN).await.unwrap().listings[0].finalized);
    let finalization_queries = h.client.event_queries().into_iter().filter(|q| *q == (77, 77)).count();
    assert_eq!(finalization_queries, 2);
}

#[tokio::test]
async fn test_top_offer_first_strictly_greater_wins() {
    let h = Harness::new();
    h.client.set_total_listings(1, 1);
    h.client.put_listing(testing::listing(1, 0));
    for (id, amount) in [(0u64, 10u64), (1, 25), (2, 25)] {
        h.client.put_offer(1, 0, testing::offer(PAYMENT_TOKEN, id, ether(amount)));
    }
    let engine = h.engine();

    engine.run_pass().await;

    let listing = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    assert_eq!(listing.offers.len(), 3);
    assert_eq!(listing.top_offer, Some(OfferRef { payment_token: PAYMENT_TOKEN, offer_id: 1 }));

    // B gets claimed while the listing is open: C takes over
    let mut claimed = testing::offer(PAYMENT_TOKEN, 1, ether(25));
    claimed.claimed = true;
    h.client.put_offer(1, 0, claimed);
    engine.run_pass().await;
    let listing = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    assert_eq!(listing.top_offer, Some(OfferRef { payment_token: PAYMENT_TOKEN, offer_id: 2 }));
}

#[tokio::test]
async fn test_claimed_offer_stays_out_after_listing_closes() {
    let h = Harness::new();
    h.client.set_total_listings(1, 1);
    h.client.put_listing(testing::listing(1, 0));
    h.client.put_offer(1, 0, testing::offer(PAYMENT_TOKEN, 0, ether(50)));
    h.client.put_offer(1, 0, testing::offer(PAYMENT_TOKEN, 1, ether(10)));
    let engine = h.engine();
    let top = |offer_id| Some(OfferRef { payment_token: PAYMENT_TOKEN, offer_id });

    engine.run_pass().await;
    assert_eq!(engine.listing(CHAIN, 1, 0, false).await.unwrap().top_offer, top(0));

    let mut claimed = testing::offer(PAYMENT_TOKEN, 0, ether(50));
    claimed.claimed = true;
    h.client.put_offer(1, 0, claimed);
    engine.run_pass().await;
    assert_eq!(engine.listing(CHAIN, 1, 0, false).await.unwrap().top_offer, top(1));

    // closed without a sale event yet: the offer claimed while open must not return
    let mut closed = testing::listing(1, 0);
    closed.sale_state = SALE_STATE_CLOSED;
    closed.closed_block = 90;
    h.client.put_listing(closed);
    engine.run_pass().await;
    let listing = engine.listing(CHAIN, 1, 0, false).await.unwrap();
    assert!(!listing.is_open());
    assert!(!listing.finalized);
    assert_eq!(listing.top_offer, top(1));
}

#[tokio::test]
async fn test_ended_releases_not_refreshed() {
    let h = Harness::new();
    let mut ended = testing::release(0, ether(1));
    ended.ended = true;
    h.client.put_release(ended);
    h.client.put_release(testing::release(1, ether(1)));
    let engine = h.engine();

    engine.run_pass().await;
    assert_eq!(h.client.calls("release"), 2);

    h.client.reset_calls();
    engine.run_pass().await;
    assert_eq!(h.client.calls("release"), 1);
    assert_eq!(engine.releases(CHAIN).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_collections_refreshed_every_pass() {
    let h = Harness::new();
    h.client.put_collection(testing::collection(0, "Genesis", vec![]));
    h.client.put_collection(testing::collection(1, "Drops", vec![]));
    let engine = h.engine();

    engine.run_pass().await;
    assert_eq!(h.client.calls("collection"), 2);

    // still within the cache TTL, yet the pass re-reads both
    h.client.put_collection(testing::collection(1, "Drops II", vec![]));
    h.client.reset_calls();
    engine.run_pass().await;
    assert_eq!(h.client.calls("collection"), 2);
    let renamed = engine.collection(CHAIN, 1, false).await.unwrap();
    assert_eq!(renamed.name, "Drops II");
}

#[tokio::test]
async fn test_managed_nft_images_not_recached() {
    let h = Harness::new();
    let nft = Address::repeat_byte(0x0a);
    let uri = "https://meta.test/a.json";
    h.client.put_nft(testing::nft(nft, Some(uri)));
    h.assets.put_metadata(uri, json!({ "image": "https://img.test/a.png" }));
    let engine = h.engine();

    let first = engine.nft(CHAIN, nft, false).await.unwrap();
    assert!(first.images.unwrap().high_res.starts_with("https://assets.test/cache/"));
    assert_eq!((h.assets.metadata_calls(), h.assets.image_calls()), (1, 1));

    engine.nft(CHAIN, nft, false).await.unwrap();
    assert_eq!((h.assets.metadata_calls(), h.assets.image_calls()), (1, 1));
    assert_eq!(h.client.calls("nft_details"), 1);

    engine.nft(CHAIN, nft, true).await.unwrap();
    assert_eq!((h.assets.metadata_calls(), h.assets.image_calls()), (2, 2));
    assert_eq!(h.client.calls("nft_details"), 2);
}

#[tokio::test]
async fn test_unmanaged_nft_images_retried_until_cached() {
    let h = Harness::new();
    let nft = Address::repeat_byte(0x0b);
    let uri = "https://meta.test/b.json";
    h.client.put_nft(testing::nft(nft, Some(uri)));
    h.assets.put_metadata(uri, json!({ "name": "No image yet" }));
    let engine = h.engine();

    assert!(engine.nft(CHAIN, nft, false).await.unwrap().images.is_none());
    assert!(engine.nft(CHAIN, nft, false).await.unwrap().images.is_none());
    assert_eq!((h.assets.metadata_calls(), h.assets.image_calls()), (2, 0));
    assert_eq!(h.client.calls("nft_details"), 1);

    h.assets.put_metadata(uri, json!({ "image": "https://img.test/b.png" }));
    assert!(engine.nft(CHAIN, nft, false).await.unwrap().images.is_some());
    engine.nft(CHAIN, nft, false).await.unwrap();
    assert_eq!((h.assets.metadata_calls(), h.assets.image_calls()), (3, 1));
}

#[tokio::test]
async fn test_release_scan_resumes_after_failed_window() {
    let h = Harness::new();
    let mut ds = ChainDataset::new(CHAIN, 1, &[1, 2]);
    ds.last_scanned_block = Some(1000);
    let h = Harness { store: Arc::new(MemorySnapshotStore::with_snapshot(vec![ds])), ..h };
    h.client.set_heads(&[7000]);
    h.client.update(|s| s.fail_sale_events = true);
    let engine = h.engine();
    assert!(engine.load_snapshot().await);

    engine.run_pass().await;
    assert_eq!(engine.dataset(CHAIN).await.unwrap().last_scanned_block, Some(1000));
    assert_eq!(h.client.event_queries(), vec![(1001, 6000)]);

    h.client.update(|s| s.fail_sale_events = false);
    h.client.reset_calls();
    engine.run_pass().await;
    assert_eq!(engine.dataset(CHAIN).await.unwrap().last_scanned_block, Some(7000));
    assert_eq!(h.client.event_queries(), vec![(1001, 6000), (6001, 7000)]);
}

#[tokio::test]
async fn test_release_scan_follows_moving_head() {
    let h = Harness::new();
    let buyer = Address::from_low_u64_be(0xcafe);
    h.client.put_release(testing::release(0, ether(3)));
    h.client.set_heads(&[100, 200]);
    h.client.push_event(testing::sale_event(
        150,
        SaleEventKind::ReleasePurchased { release_id: 0, buyer, quantity: 2 },
    ));
    let engine = h.engine();

    engine.run_pass().await;

    let ds = engine.dataset(CHAIN).await.unwrap();
    assert_eq!(ds.last_scanned_block, Some(200));
    assert_eq!(h.client.event_queries(), vec![(1, 100), (101, 200)]);
    let sales = engine.release_sales(CHAIN).await.unwrap();
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].buyer, buyer);
    assert_eq!(sales[0].quantity, 2);
    assert_eq!(sales[0].block_number, 150);
    assert_eq!(sales[0].price, Some(ether(3)));
    assert_eq!(sales[0].payment_token, Some(PAYMENT_TOKEN));
}

#[tokio::test]
async fn test_scan_respects_block_budget() {
    let h = Harness::new();
    h.client.set_heads(&[20_000]);
    let settings = SyncSettings { max_blocks_per_pass: 7000, ..Harness::settings() };
    let engine = h.engine_with(settings);

    engine.run_pass().await;

    assert_eq!(engine.dataset(CHAIN).await.unwrap().last_scanned_block, Some(7000));
    assert_eq!(h.client.event_queries(), vec![(1, 5000), (5001, 7000)]);
}

#[tokio::test]
async fn test_pass_twice_without_changes_is_idempotent() {
    let h = Harness::new();
    let nft = Address::repeat_byte(0x0b);
    h.client.set_total_listings(1, 2);
    h.client.put_listing(testing::listing(1, 0));
    h.client.put_listing(testing::listing(1, 1));
    h.client.put_offer(1, 0, testing::offer(PAYMENT_TOKEN, 0, ether(1)));
    h.client.put_collection(testing::collection(0, "Genesis", vec![nft]));
    h.client.put_release(testing::release(0, ether(1)));
    h.client.put_nft(testing::nft(nft, Some("ipfs://meta")));
    h.client.put_token_uri(nft, U256::from(0u64), "ipfs://token/0");
    h.assets.put_metadata("ipfs://meta", json!({ "name": "Genesis", "image": "ipfs://image" }));
    h.client.set_heads(&[500]);
    let engine = h.engine();

    engine.run_pass().await;
    let first = engine.dataset(CHAIN).await.unwrap();
    engine.run_pass().await;
    let second = engine.dataset(CHAIN).await.unwrap();

    assert_eq!(normalized(&first), normalized(&second));
    assert_eq!(first.listings[0].collection_id, Some(0));
    assert!(first.nfts[0].images.is_some());
}

#[tokio::test]
async fn test_deadline_marks_chain_incomplete() {
    let h = Harness::new();
    h.client.set_total_listings(1, 5);
    let settings = SyncSettings { max_pass_seconds_bootstrap: 0, ..Harness::settings() };
    let engine = h.engine_with(settings);

    let report = engine.run_pass().await;

    assert_eq!(report.incomplete_chains, vec![CHAIN.to_string()]);
    assert!(report.bootstrap);
    let status = engine.status().await;
    assert_eq!(status.incomplete_chains, vec![CHAIN.to_string()]);
    let chain = &status.chains[0];
    assert!(!chain.last_sync_completed);
    assert!(!chain.bootstrap_completed);
    assert!(!chain.updated.counts);
    assert_eq!(h.store.saves(), 1);
    assert_eq!(engine.metrics().snapshot().incomplete_passes, 1);
}

#[tokio::test]
async fn test_completed_pass_sets_every_stage_flag() {
    let h = Harness::new();
    let engine = h.engine();

    let report = engine.run_pass().await;

    assert!(report.incomplete_chains.is_empty());
    let ds = engine.dataset(CHAIN).await.unwrap();
    assert!(ds.updated.all_set());
    assert!(ds.last_sync_completed);
    assert!(ds.bootstrap_completed);
    assert_eq!(engine.token_price(PRICE_KEY).map(|p| p.usd), Some(1.0));
}

#[tokio::test]
async fn test_ipfs_images_submitted_for_pinning() {
    let cid = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
    let h = Harness::new();
    let nft = Address::repeat_byte(0x0f);
    h.client.put_release(testing::release(0, ether(1)));
    h.client.put_nft(testing::nft(nft, Some("https://meta.test/contract.json")));
    h.assets
        .put_metadata("https://meta.test/contract.json", json!({ "image": format!("ipfs://{}/logo.png", cid) }));
    let engine = h.engine();

    engine.run_pass().await;

    assert_eq!(h.pinner.batches(), vec![vec![cid.to_string()]]);
    let record = engine.nft(CHAIN, nft, false).await.unwrap();
    assert!(record.images.unwrap().high_res.starts_with("https://assets.test/cache/"));
}

#[tokio::test]
async fn test_snapshot_round_trip_keeps_unconfigured_chains() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    let seed = JsonFileStore::new(&path);
    let mut retired = ChainDataset::new("retired", 99, &[1]);
    retired.last_scanned_block = Some(5);
    seed.save(&[retired]).await.unwrap();

    let h = Harness::new();
    h.client.set_total_listings(1, 1);
    h.client.put_listing(testing::listing(1, 0));
    let services = testing::services(h.oracle.clone(), h.assets.clone(), None);
    let client: Arc<dyn ChainClient> = h.client.clone();
    let engine = SyncEngine::new(
        Harness::settings(),
        vec![(testing::chain_config(CHAIN), client)],
        services,
        Arc::new(JsonFileStore::new(&path)),
    );
    assert!(engine.load_snapshot().await);
    engine.run_pass().await;

    let saved = JsonFileStore::new(&path).load().await.unwrap().unwrap();
    let names: Vec<&str> = saved.iter().map(|d| d.chain.as_str()).collect();
    assert_eq!(names, vec![CHAIN, "retired"]);
    assert_eq!(saved[0].listings.len(), 1);
    assert_eq!(saved[1].last_scanned_block, Some(5));
}
