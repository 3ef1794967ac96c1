//! Function bundler with the production steps.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lora_cache::CacheStore;
use lora_cache::CacheStoreExt;
use lora_cache::DeterministicCacheStore;
use lora_cache::LockWaitConfig;
use lora_coordination::keys;
use lora_coordination::AdrDecision;
use lora_coordination::AdrManager;
use lora_coordination::AdrRequest;
use lora_coordination::BundlerItems;
use lora_coordination::BundlerRequest;
use lora_coordination::CoordinationConfig;
use lora_coordination::CoordinationError;
use lora_coordination::DevEui;
use lora_coordination::DeviceFrameCounterState;
use lora_coordination::DeviceManager;
use lora_coordination::InMemoryRegistry;
use tokio_util::sync::CancellationToken;

const DEV: DevEui = DevEui(0x0102_0304_0506_0708);

/// Confirms every decision and counts compensations.
#[derive(Default)]
struct ConfirmingAdr {
    confirm: bool,
    aborted: AtomicUsize,
}

#[async_trait]
impl AdrManager for ConfirmingAdr {
    async fn calculate(
        &self,
        _dev_eui: DevEui,
        _gateway_id: &str,
        request: &AdrRequest,
    ) -> Result<AdrDecision, CoordinationError> {
        Ok(AdrDecision {
            can_confirm_to_device: self.confirm,
            data_rate: Some(request.data_rate.saturating_add(1)),
            tx_power: Some(2),
            nb_repetition: Some(1),
            fcnt_down: None,
        })
    }

    async fn on_abort(&self, _dev_eui: DevEui, _gateway_id: &str) -> Result<(), CoordinationError> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn manager(store: Arc<DeterministicCacheStore>, adr: Arc<ConfirmingAdr>) -> DeviceManager<DeterministicCacheStore, InMemoryRegistry> {
    DeviceManager::new(store, InMemoryRegistry::new(10), adr, &CoordinationConfig::default())
}

fn request(gateway_id: &str, fcnt_up: u32, fcnt_down: u32, items: BundlerItems) -> BundlerRequest {
    BundlerRequest {
        gateway_id: gateway_id.to_string(),
        client_fcnt_up: fcnt_up,
        client_fcnt_down: fcnt_down,
        rssi: -75.0,
        adr: Some(AdrRequest {
            data_rate: 3,
            snr: 9.0,
            fcnt_up,
            fcnt_down,
            perform_calculation: true,
            clear_cache: false,
        }),
        items,
    }
}

async fn state(store: &DeterministicCacheStore) -> Option<DeviceFrameCounterState> {
    store.object_get(&keys::device_state(DEV)).await.unwrap()
}

#[tokio::test]
async fn test_duplicate_aborts_with_partial_outcome() {
    let store = DeterministicCacheStore::new();
    let lns = manager(store.clone(), Arc::new(ConfirmingAdr::default()));
    let items = BundlerItems::DEDUPLICATION | BundlerItems::FCNT_DOWN;
    let cancel = CancellationToken::new();

    let owner = lns.execute_function_bundler(DEV, &request("gw-a", 8, 2, items), &cancel).await.unwrap();
    assert_eq!(owner.next_fcnt_down, Some(3));
    assert!(!owner.deduplication.unwrap().is_duplicate);

    let duplicate = lns.execute_function_bundler(DEV, &request("gw-b", 8, 2, items), &cancel).await.unwrap_err();
    assert_eq!(duplicate.step, "deduplication");
    assert_eq!(duplicate.reason, "duplicate uplink, owner is gw-a");
    let dedup = duplicate.outcome.deduplication.unwrap();
    assert!(dedup.is_duplicate);
    assert_eq!(dedup.gateway_id, "gw-a");
    assert_eq!(duplicate.outcome.next_fcnt_down, None);
    assert_eq!(state(&store).await.unwrap().fcnt_down, 3);
}

#[tokio::test]
async fn test_adr_counter_reused_by_fcnt_step() {
    let store = DeterministicCacheStore::new();
    let adr = Arc::new(ConfirmingAdr {
        confirm: true,
        ..ConfirmingAdr::default()
    });
    let lns = manager(store.clone(), adr);
    let items = BundlerItems::ADR | BundlerItems::FCNT_DOWN;

    let outcome = lns
        .execute_function_bundler(DEV, &request("gw-a", 20, 5, items), &CancellationToken::new())
        .await
        .unwrap();
    let decision = outcome.adr.unwrap();
    assert!(decision.can_confirm_to_device);
    assert_eq!(decision.fcnt_down, Some(6));
    assert_eq!(outcome.next_fcnt_down, Some(6));
    // One counter issued, not two
    assert_eq!(state(&store).await.unwrap().fcnt_down, 6);
}

#[tokio::test]
async fn test_adr_confirmation_dropped_for_non_owner() {
    let store = DeterministicCacheStore::new();
    let adr = Arc::new(ConfirmingAdr {
        confirm: true,
        ..ConfirmingAdr::default()
    });
    let lns = manager(store.clone(), adr);
    lns.next_fcnt_down(DEV, "gw-a", 20, 5).await.unwrap();

    let outcome = lns
        .execute_function_bundler(DEV, &request("gw-b", 20, 5, BundlerItems::ADR | BundlerItems::FCNT_DOWN), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!outcome.adr.unwrap().can_confirm_to_device);
    assert_eq!(outcome.next_fcnt_down, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_contention_compensates_adr() {
    let store = Arc::new(DeterministicCacheStore::with_wait_config(LockWaitConfig {
        timeout_ms: 50,
        ..LockWaitConfig::default()
    }));
    let adr = Arc::new(ConfirmingAdr::default());
    let lns = manager(store.clone(), adr.clone());
    store.lock_take(&keys::device_lock(DEV), "stuck-gateway", Duration::from_secs(30), false).await.unwrap();

    let aborted = lns
        .execute_function_bundler(DEV, &request("gw-a", 1, 0, BundlerItems::ADR | BundlerItems::FCNT_DOWN), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(aborted.step, "next_fcnt_down");
    assert_eq!(aborted.reason, "device lock contended");
    assert!(aborted.outcome.adr.is_some());
    assert_eq!(adr.aborted.load(Ordering::SeqCst), 1);
    assert!(state(&store).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_preferred_gateway_step_always_continues() {
    let store = DeterministicCacheStore::new();
    let lns = manager(store.clone(), Arc::new(ConfirmingAdr::default()));
    let items = BundlerItems::FCNT_DOWN | BundlerItems::PREFERRED_GATEWAY;

    let outcome = lns
        .execute_function_bundler(DEV, &request("gw-a", 4, 0, items), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.next_fcnt_down, Some(1));
    let preferred = outcome.preferred_gateway.unwrap();
    assert_eq!(preferred.preferred_gateway_id.as_deref(), Some("gw-a"));
    assert!(preferred.is_successful());

    let stale = lns
        .execute_function_bundler(DEV, &request("gw-b", 3, 0, BundlerItems::PREFERRED_GATEWAY), &CancellationToken::new())
        .await
        .unwrap();
    assert!(stale.preferred_gateway.unwrap().conflict);
}

#[tokio::test]
async fn test_adr_without_metrics_aborts() {
    let store = DeterministicCacheStore::new();
    let lns = manager(store, Arc::new(ConfirmingAdr::default()));
    let mut bare = request("gw-a", 1, 0, BundlerItems::ADR);
    bare.adr = None;

    let aborted = lns.execute_function_bundler(DEV, &bare, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(aborted.step, "adr");
    assert!(aborted.error.is_none());
}
