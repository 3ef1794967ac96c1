//! Device manager facade.
//!
//! Wires the coordination components over one cache and one registry and
//! exposes the operations the network server calls.

use std::sync::Arc;

use lora_cache::CacheStore;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::adr::AdrManager;
use crate::bundler::BundlerRequest;
use crate::bundler::BundlerStep;
use crate::bundler::FunctionBundler;
use crate::bundler::PipelineAborted;
use crate::bundler::PipelineOutcome;
use crate::config::CoordinationConfig;
use crate::dedup::Deduplicator;
use crate::devaddr_cache::DevAddrCache;
use crate::devaddr_cache::DevAddrLookup;
use crate::devaddr_cache::DevAddrReconciler;
use crate::devaddr_cache::JoinedDevice;
use crate::devaddr_cache::SyncReport;
use crate::error::CoordinationError;
use crate::error::RegistrySnafu;
use crate::fcnt::FCntDownResult;
use crate::fcnt::FrameCounterArbitrator;
use crate::fcnt::ResetOutcome;
use crate::join::JoinCoordinator;
use crate::join::JoinDecision;
use crate::preferred_gateway::PreferredGatewayResolver;
use crate::registry::DeviceRegistry;
use crate::types::DevAddr;
use crate::types::DevEui;
use crate::types::DevNonce;

/// Entry point for every device coordination operation of one process.
pub struct DeviceManager<S: CacheStore + ?Sized + 'static, R: DeviceRegistry + ?Sized> {
    registry: Arc<R>,
    arbitrator: Arc<FrameCounterArbitrator<S>>,
    joins: JoinCoordinator<S, R>,
    addresses: DevAddrCache<S, R>,
    reconciler: Arc<DevAddrReconciler<S, R>>,
    bundler: FunctionBundler<BundlerStep<S>>,
}

impl<S, R> DeviceManager<S, R>
where
    S: CacheStore + ?Sized + 'static,
    R: DeviceRegistry + ?Sized,
{
    /// Build every component from `config`.
    pub fn new(store: Arc<S>, registry: Arc<R>, adr: Arc<dyn AdrManager>, config: &CoordinationConfig) -> Self {
        let arbitrator = Arc::new(FrameCounterArbitrator::new(store.clone(), config));
        let steps = BundlerStep::standard(
            Arc::new(Deduplicator::new(store.clone(), config)),
            adr,
            arbitrator.clone(),
            Arc::new(PreferredGatewayResolver::new(store.clone(), config)),
        );

        Self {
            joins: JoinCoordinator::new(store.clone(), registry.clone(), config),
            addresses: DevAddrCache::new(store.clone(), registry.clone(), config),
            reconciler: Arc::new(DevAddrReconciler::new(store, registry.clone(), config)),
            bundler: FunctionBundler::new(steps),
            arbitrator,
            registry,
        }
    }

    /// Next downlink counter for an uplink seen by `gateway_id`.
    pub async fn next_fcnt_down(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        fcnt_up: u32,
        fcnt_down: u32,
    ) -> Result<FCntDownResult, CoordinationError> {
        self.arbitrator.next_fcnt_down(dev_eui, gateway_id, fcnt_up, fcnt_down).await
    }

    /// Reset an ABP device's session if it has progressed past its first uplink.
    pub async fn abp_fcnt_cache_reset(&self, dev_eui: DevEui, gateway_id: &str) -> Result<ResetOutcome, CoordinationError> {
        self.arbitrator.abp_fcnt_cache_reset(dev_eui, gateway_id).await
    }

    /// Evict a device's frame-counter state unconditionally.
    pub async fn clear_device_cache(&self, dev_eui: DevEui) -> Result<ResetOutcome, CoordinationError> {
        self.arbitrator.clear_device_cache(dev_eui).await
    }

    /// Validate a join and consume its nonce.
    pub async fn resolve_join(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        dev_nonce: DevNonce,
    ) -> Result<JoinDecision, CoordinationError> {
        self.joins.resolve_join(dev_eui, gateway_id, dev_nonce).await
    }

    /// Devices using `dev_addr`.
    pub async fn resolve_dev_addr(&self, dev_addr: DevAddr) -> Result<DevAddrLookup, CoordinationError> {
        self.addresses.resolve(dev_addr).await
    }

    /// Record a device that just joined.
    pub async fn add_device(&self, device: JoinedDevice) -> Result<bool, CoordinationError> {
        self.addresses.add_device(device).await
    }

    /// Primary credential of a device, `None` if the registry does not know it.
    pub async fn primary_credential(&self, dev_eui: DevEui) -> Result<Option<String>, CoordinationError> {
        self.registry.get_primary_credential(dev_eui).await.context(RegistrySnafu {
            dev_eui,
            operation: "get primary credential",
        })
    }

    /// Run whichever address cache reconciliation pass is due.
    pub async fn sync_dev_addr_cache(&self) -> Result<SyncReport, CoordinationError> {
        self.reconciler.perform_needed_syncs().await
    }

    /// The reconciler, for scheduling.
    pub fn reconciler(&self) -> Arc<DevAddrReconciler<S, R>> {
        self.reconciler.clone()
    }

    /// Run the requested pipeline steps for one uplink.
    pub async fn execute_function_bundler(
        &self,
        dev_eui: DevEui,
        request: &BundlerRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineAborted> {
        self.bundler.execute(dev_eui, request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use lora_cache::DeterministicCacheStore;

    use super::*;
    use crate::adr::DisabledAdrManager;
    use crate::bundler::BundlerItems;
    use crate::registry::InMemoryRegistry;
    use crate::registry::RegisteredDevice;

    fn manager(registry: &Arc<InMemoryRegistry>) -> DeviceManager<DeterministicCacheStore, InMemoryRegistry> {
        DeviceManager::new(
            DeterministicCacheStore::new(),
            registry.clone(),
            Arc::new(DisabledAdrManager),
            &CoordinationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_join_then_uplink() {
        let registry = InMemoryRegistry::new(10);
        registry.upsert(RegisteredDevice::new(DevEui(0xAB), "key")).await;
        let manager = manager(&registry);

        assert!(matches!(
            manager.resolve_join(DevEui(0xAB), "gw", DevNonce(1)).await.unwrap(),
            JoinDecision::Accepted { .. }
        ));
        manager
            .add_device(JoinedDevice {
                dev_addr: DevAddr(0x42),
                dev_eui: DevEui(0xAB),
                gateway_id: Some("gw".to_string()),
                network_session_key: None,
                primary_credential: None,
            })
            .await
            .unwrap();
        assert_eq!(manager.resolve_dev_addr(DevAddr(0x42)).await.unwrap().matches().len(), 1);

        let request = BundlerRequest {
            gateway_id: "gw".to_string(),
            client_fcnt_up: 1,
            client_fcnt_down: 0,
            rssi: -70.0,
            adr: None,
            items: BundlerItems::DEDUPLICATION | BundlerItems::FCNT_DOWN,
        };
        let outcome = manager
            .execute_function_bundler(DevEui(0xAB), &request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.next_fcnt_down, Some(1));
        assert!(!outcome.deduplication.unwrap().is_duplicate);
        assert_eq!(manager.clear_device_cache(DevEui(0xAB)).await.unwrap(), ResetOutcome::Cleared);
    }

    #[tokio::test]
    async fn test_primary_credential() {
        let registry = InMemoryRegistry::new(10);
        registry.upsert(RegisteredDevice::new(DevEui(1), "k1")).await;
        let manager = manager(&registry);
        assert_eq!(manager.primary_credential(DevEui(1)).await.unwrap().as_deref(), Some("k1"));
        assert_eq!(manager.primary_credential(DevEui(2)).await.unwrap(), None);
    }
}
