use market_sync::chain_client::ChainClient;
use market_sync::settings::SyncSettings;
use market_sync::sync::testing::{self, MemorySnapshotStore, MockAssetCache, MockChainClient, MockPriceOracle};
use market_sync::sync::{Scheduler, SyncEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn engine(settings: SyncSettings, store: Arc<MemorySnapshotStore>) -> Arc<SyncEngine> {
    let client: Arc<dyn ChainClient> = Arc::new(MockChainClient::new());
    let services = testing::services(
        Arc::new(MockPriceOracle::new().with_price(testing::PRICE_KEY, 1.0)),
        Arc::new(MockAssetCache::new()),
        None,
    );
    Arc::new(SyncEngine::new(settings, vec![(testing::chain_config("testnet"), client)], services, store))
}

#[tokio::test]
async fn test_stops_after_current_pass_on_shutdown() {
    let store = Arc::new(MemorySnapshotStore::default());
    let settings = SyncSettings { throttle_delay_ms: 0, ..SyncSettings::default() };
    let engine = engine(settings, store.clone());
    let (_tx, rx) = watch::channel(true);

    let passes = Scheduler::new(engine.clone()).run(rx).await;

    assert_eq!(passes, 1);
    assert_eq!(store.saves(), 1);
    assert_eq!(engine.metrics().snapshot().passes, 1);
}

#[tokio::test]
async fn test_metrics_window_resets_counters() {
    let store = Arc::new(MemorySnapshotStore::default());
    let settings = SyncSettings { throttle_delay_ms: 0, metrics_reset_seconds: 0, ..SyncSettings::default() };
    let engine = engine(settings, store);
    let (_tx, rx) = watch::channel(true);

    Scheduler::new(engine.clone()).run(rx).await;

    assert_eq!(engine.metrics().snapshot().passes, 0);
    assert_eq!(engine.metrics().snapshot().authoritative_fetches, 0);
}

#[tokio::test]
async fn test_passes_repeat_until_shutdown() {
    let store = Arc::new(MemorySnapshotStore::default());
    let settings = SyncSettings { throttle_delay_ms: 0, ..SyncSettings::default() };
    let engine = engine(settings, store.clone());
    let (tx, rx) = watch::channel(false);

    let scheduler = Scheduler::new(engine).with_interval(Duration::from_millis(10));
    let handle = tokio::spawn(async move { scheduler.run(rx).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    let passes = handle.await.unwrap();

    assert!(passes >= 2);
    assert_eq!(store.saves(), passes);
}
