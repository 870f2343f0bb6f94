mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use tokio::time::timeout;

use common::{MockNetwork, message_at, user};
use ripple_cache::{CacheConfig, CacheRuntime};
use ripple_store::Store;
use ripple_types::events::{CacheEvent, LoadPhase};
use ripple_types::models::{Entity, EntityKind, Relationship};

async fn next_messages_event(
    rx: &mut broadcast::Receiver<CacheEvent>,
) -> (LoadPhase, Vec<String>) {
    loop {
        let event = timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a messages event")
            .unwrap();
        if let CacheEvent::MessagesUpdated { phase, channel_ids } = event {
            return (phase, channel_ids);
        }
    }
}

#[tokio::test]
async fn sync_flows_from_network_to_notification() {
    common::init_tracing();
    let network = Arc::new(MockNetwork::new());
    let base = Utc::now() - Duration::minutes(10);
    network.seed_messages(
        "chn1",
        (0..5).map(|i| message_at("chn1", "alice", base + Duration::seconds(i))).collect(),
    );
    network.seed_user(user("alice", Relationship::Friend));

    let store = Arc::new(Store::open_in_memory().unwrap());
    let runtime = CacheRuntime::start(store.clone(), network, CacheConfig::default());
    let mut rx = runtime.notifier().subscribe();

    // Observers announce the (empty) cached state first
    let (phase, channels) = next_messages_event(&mut rx).await;
    assert_eq!(phase, LoadPhase::InitialLoad);
    assert!(channels.is_empty());

    assert!(runtime.orchestrator().sync_channel_messages("chn1").await);

    let (phase, channels) = next_messages_event(&mut rx).await;
    assert_eq!(phase, LoadPhase::Incremental);
    assert_eq!(channels, vec!["chn1".to_string()]);

    // The page and its bundled author landed in the store
    assert_eq!(store.fetch_all(EntityKind::Message).unwrap().len(), 5);
    assert!(store.user_by_id("alice").unwrap().is_some());
}

#[tokio::test]
async fn retention_deletions_reach_subscribers() {
    common::init_tracing();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let now = Utc::now();
    store
        .upsert_batch(&[
            Entity::Message(message_at("chn1", "ghost", now - Duration::days(45))),
            Entity::Message(message_at("chn2", "alice", now - Duration::minutes(1))),
            Entity::User(user("ghost", Relationship::None)),
            Entity::User(user("alice", Relationship::None)),
        ])
        .unwrap();

    let network = Arc::new(MockNetwork::new());
    let runtime = CacheRuntime::start(store.clone(), network, CacheConfig::default());
    let mut rx = runtime.notifier().subscribe();

    // Initial load first, so later events are incremental
    let (phase, _) = next_messages_event(&mut rx).await;
    assert_eq!(phase, LoadPhase::InitialLoad);

    let report = runtime.force_cleanup().await.expect("no cycle should be running");
    assert_eq!(report.expired_messages, 1);
    assert_eq!(report.orphaned_users, 1);

    // The deletion batch had no payload; the observer fell back to the
    // channels still holding messages.
    let (phase, channels) = next_messages_event(&mut rx).await;
    assert_eq!(phase, LoadPhase::Incremental);
    assert_eq!(channels, vec!["chn2".to_string()]);

    // "ghost" authored only the expired message and had no relationship
    assert!(store.user_by_id("ghost").unwrap().is_none());
    assert!(store.user_by_id("alice").unwrap().is_some());
}

#[tokio::test]
async fn wipe_all_clears_store_and_notifies_once() {
    common::init_tracing();
    let store = Arc::new(Store::open_in_memory().unwrap());
    store
        .upsert(&Entity::Message(message_at("chn1", "alice", Utc::now())))
        .unwrap();

    let network = Arc::new(MockNetwork::new());
    let runtime = CacheRuntime::start(store.clone(), network, CacheConfig::default());
    let mut rx = runtime.notifier().subscribe();

    let (phase, _) = next_messages_event(&mut rx).await;
    assert_eq!(phase, LoadPhase::InitialLoad);

    runtime.gateway().wipe_all().await.unwrap();

    let mut wipes = 0;
    loop {
        match timeout(StdDuration::from_millis(300), rx.recv()).await {
            Ok(Ok(CacheEvent::StoreWiped)) => wipes += 1,
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(wipes, 1);

    for kind in EntityKind::ALL {
        assert!(store.fetch_all(kind).unwrap().is_empty());
    }
}

#[tokio::test]
async fn jump_to_message_syncs_the_surrounding_window() {
    common::init_tracing();
    let network = Arc::new(MockNetwork::new());
    let base = Utc::now() - Duration::hours(1);
    let history: Vec<_> = (0..200)
        .map(|i| message_at("chn1", "alice", base + Duration::seconds(i)))
        .collect();
    network.seed_messages("chn1", history.clone());
    network.seed_user(user("alice", Relationship::None));

    let store = Arc::new(Store::open_in_memory().unwrap());
    let runtime = CacheRuntime::start(store.clone(), network, CacheConfig::default());

    let target = &history[100];
    assert!(
        runtime
            .orchestrator()
            .sync_target_message(&target.id, "chn1")
            .await
    );

    // The target and a window around it are cached now
    assert!(
        store
            .fetch_by_key(EntityKind::Message, &target.id)
            .unwrap()
            .is_some()
    );
    let cached = store.fetch_all(EntityKind::Message).unwrap();
    assert!(cached.len() > 1);
    assert!(cached.len() < history.len());
}

#[tokio::test]
async fn observer_health_is_tracked_per_kind() {
    common::init_tracing();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    let runtime = CacheRuntime::start(store, network, CacheConfig::default());
    let mut rx = runtime.notifier().subscribe();

    // All observers report healthy once their initial reads land
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
    loop {
        if EntityKind::ALL.iter().all(|k| runtime.observer_health().is_healthy(*k)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "observers never became healthy");
        let _ = timeout(StdDuration::from_millis(50), rx.recv()).await;
    }
    assert_eq!(runtime.observer_health().lag_count(EntityKind::Message), 0);
}
