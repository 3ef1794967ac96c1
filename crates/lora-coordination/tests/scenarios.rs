//! End-to-end coordination scenarios across simulated gateway processes.
//!
//! Each "process" is its own `DeviceManager` sharing one cache and registry,
//! the way independent network server instances share a deployment.

use std::sync::Arc;

use lora_cache::CacheStore;
use lora_cache::CacheStoreExt;
use lora_cache::DeterministicCacheStore;
use lora_coordination::keys;
use lora_coordination::CoordinationConfig;
use lora_coordination::DevAddr;
use lora_coordination::DevAddrLookup;
use lora_coordination::DevEui;
use lora_coordination::DevNonce;
use lora_coordination::DeviceFrameCounterState;
use lora_coordination::DeviceManager;
use lora_coordination::DisabledAdrManager;
use lora_coordination::FCntDownResult;
use lora_coordination::InMemoryRegistry;
use lora_coordination::JoinDecision;
use lora_coordination::LookupSource;
use lora_coordination::RegisteredDevice;
use lora_coordination::ResetOutcome;
use lora_coordination::SyncKind;

type Manager = DeviceManager<DeterministicCacheStore, InMemoryRegistry>;

fn process(store: &Arc<DeterministicCacheStore>, registry: &Arc<InMemoryRegistry>, name: &str) -> Arc<Manager> {
    let config = CoordinationConfig {
        instance_id: name.to_string(),
        ..CoordinationConfig::default()
    };
    Arc::new(DeviceManager::new(store.clone(), registry.clone(), Arc::new(DisabledAdrManager), &config))
}

async fn cached_state(store: &DeterministicCacheStore, dev_eui: DevEui) -> Option<DeviceFrameCounterState> {
    store.object_get(&keys::device_state(dev_eui)).await.unwrap()
}

#[tokio::test]
async fn test_downlink_counter_scenario() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(10);
    let lns = process(&store, &registry, "lns-1");
    let d1 = DevEui(0xD1);

    assert_eq!(lns.next_fcnt_down(d1, "G1", 1, 1).await.unwrap(), FCntDownResult::Issued(2));
    assert_eq!(lns.next_fcnt_down(d1, "G1", 1, 1).await.unwrap(), FCntDownResult::Issued(3));
    assert_eq!(lns.next_fcnt_down(d1, "G1", 3, 10).await.unwrap(), FCntDownResult::Issued(11));

    let before = cached_state(&store, d1).await;
    let late = lns.next_fcnt_down(d1, "G1", 1, 1).await.unwrap();
    assert_eq!(late, FCntDownResult::NotOwner);
    assert_eq!(late.wire_value(), Some(0));
    assert_eq!(cached_state(&store, d1).await, before);
}

#[tokio::test(start_paused = true)]
async fn test_one_gateway_wins_each_uplink() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(10);
    let dev = DevEui(0xFEED);

    let mut tasks = Vec::new();
    for n in 0..6 {
        let lns = process(&store, &registry, &format!("lns-{n}"));
        tasks.push(tokio::spawn(async move { lns.next_fcnt_down(dev, &format!("gw-{n}"), 10, 4).await }));
    }

    let mut issued = Vec::new();
    for task in tasks {
        match task.await.unwrap().unwrap() {
            FCntDownResult::Issued(fcnt_down) => issued.push(fcnt_down),
            FCntDownResult::NotOwner => {}
            FCntDownResult::Contended => panic!("lock wait bound should not be reached"),
        }
    }
    assert_eq!(issued, vec![5]);
    assert!(!store.key_exists(&keys::device_lock(dev)).await.unwrap());
}

#[tokio::test]
async fn test_join_scenario() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(10);
    let d2 = DevEui(0xD2);
    registry.upsert(RegisteredDevice::new(d2, "d2-key")).await;
    let lns = process(&store, &registry, "lns-1");

    lns.next_fcnt_down(d2, "gwX", 30, 9).await.unwrap();
    assert!(cached_state(&store, d2).await.is_some());

    let accepted = lns.resolve_join(d2, "gwX", DevNonce(7)).await.unwrap();
    assert_eq!(accepted, JoinDecision::Accepted {
        credential: "d2-key".to_string(),
        desired_gateway: None,
    });
    assert!(cached_state(&store, d2).await.is_none());

    assert_eq!(lns.resolve_join(d2, "gwX", DevNonce(7)).await.unwrap(), JoinDecision::NonceReplay);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_join_nonce_race() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(10);
    let dev = DevEui(0x10AD);
    registry.upsert(RegisteredDevice::new(dev, "key")).await;

    let mut tasks = Vec::new();
    for n in 0..4 {
        let lns = process(&store, &registry, &format!("lns-{n}"));
        tasks.push(tokio::spawn(async move { lns.resolve_join(dev, &format!("gw-{n}"), DevNonce(99)).await }));
    }

    let mut accepted = 0;
    let mut replays = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            JoinDecision::Accepted { .. } => accepted += 1,
            JoinDecision::NonceReplay => replays += 1,
            other => panic!("unexpected decision {other:?}"),
        }
    }
    assert_eq!((accepted, replays), (1, 3));
}

#[tokio::test]
async fn test_abp_reset_guard() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(10);
    let lns = process(&store, &registry, "lns-1");
    let dev = DevEui(0xABB);

    lns.next_fcnt_down(dev, "gw", 1, 0).await.unwrap();
    assert_eq!(lns.abp_fcnt_cache_reset(dev, "gw").await.unwrap(), ResetOutcome::Skipped);
    assert!(cached_state(&store, dev).await.is_some());

    lns.next_fcnt_down(dev, "gw", 2, 0).await.unwrap();
    assert_eq!(lns.abp_fcnt_cache_reset(dev, "gw").await.unwrap(), ResetOutcome::Cleared);
    assert!(cached_state(&store, dev).await.is_none());
}

#[tokio::test]
async fn test_address_cache_sentinel_across_processes() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(10);
    let first = process(&store, &registry, "lns-1");
    let second = process(&store, &registry, "lns-2");
    let addr = DevAddr(0x2601_1234);

    assert_eq!(first.resolve_dev_addr(addr).await.unwrap(), DevAddrLookup::Resolved {
        matches: Vec::new(),
        source: LookupSource::Registry,
    });
    assert_eq!(second.resolve_dev_addr(addr).await.unwrap(), DevAddrLookup::Resolved {
        matches: Vec::new(),
        source: LookupSource::Cache,
    });
    assert_eq!(registry.call_counts().find_by_dev_addr, 1);
}

#[tokio::test]
async fn test_reconciliation_picks_up_new_devices() {
    let store = DeterministicCacheStore::new();
    let registry = InMemoryRegistry::new(3);
    let lns = process(&store, &registry, "lns-1");
    let addr = DevAddr(0x0000_0BAD);

    assert!(lns.resolve_dev_addr(addr).await.unwrap().matches().is_empty());
    assert_eq!(lns.sync_dev_addr_cache().await.unwrap().kind, SyncKind::Full);

    registry.upsert(RegisteredDevice::new(DevEui(77), "k77").with_dev_addr(addr)).await;
    let delta = lns.sync_dev_addr_cache().await.unwrap();
    assert_eq!(delta.kind, SyncKind::Delta);
    assert_eq!(delta.buckets_written, 1);

    let lookup = lns.resolve_dev_addr(addr).await.unwrap();
    assert_eq!(lookup.matches().len(), 1);
    assert_eq!(lookup.matches()[0].primary_credential.as_deref(), Some("k77"));
}
