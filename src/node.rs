//! Node bootstrap: cache store, registry, coordination facade and the
//! background reconciliation task, wired from a [`FacadeConfig`].

use std::sync::Arc;

use lora_cache::DeterministicCacheStore;
use lora_coordination::AdrManager;
use lora_coordination::DevAddrSyncScheduler;
use lora_coordination::DeviceManager;
use lora_coordination::DisabledAdrManager;
use lora_coordination::InMemoryRegistry;
use tracing::info;

use crate::config::ConfigError;
use crate::config::FacadeConfig;
use crate::config::RegistrySeed;

/// The facade type served by a node.
pub type FacadeManager = DeviceManager<DeterministicCacheStore, InMemoryRegistry>;

/// A running node.
pub struct FacadeNode {
    store: Arc<DeterministicCacheStore>,
    registry: Arc<InMemoryRegistry>,
    manager: Arc<FacadeManager>,
    sync: Option<DevAddrSyncScheduler>,
}

impl FacadeNode {
    /// Start a node with ADR disabled.
    ///
    /// Must be called inside a Tokio runtime when reconciliation is enabled.
    pub async fn start(config: &FacadeConfig) -> Result<Self, ConfigError> {
        Self::start_with_adr(config, Arc::new(DisabledAdrManager)).await
    }

    /// Start a node with a caller-provided ADR manager.
    pub async fn start_with_adr(config: &FacadeConfig, adr: Arc<dyn AdrManager>) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = Arc::new(DeterministicCacheStore::with_wait_config(config.lock_wait()));
        let registry = InMemoryRegistry::new(config.registry.page_size);
        if let Some(path) = &config.registry.seed_file {
            let seed = RegistrySeed::from_toml_file(path)?;
            let count = seed.devices.len();
            for device in seed.devices {
                registry.upsert(device).await;
            }
            info!(path = %path.display(), devices = count, "registry seeded");
        }

        let manager = Arc::new(DeviceManager::new(store.clone(), registry.clone(), adr, &config.coordination()));
        let sync = config.sync.enabled.then(|| DevAddrSyncScheduler::spawn(manager.reconciler()));

        info!(
            instance_id = %config.instance_id,
            sync_enabled = config.sync.enabled,
            sync_interval_secs = config.sync.interval_secs,
            "lora facade node started"
        );

        Ok(Self {
            store,
            registry,
            manager,
            sync,
        })
    }

    /// The coordination facade.
    pub fn manager(&self) -> Arc<FacadeManager> {
        self.manager.clone()
    }

    /// The shared cache store.
    pub fn store(&self) -> Arc<DeterministicCacheStore> {
        self.store.clone()
    }

    /// The device registry.
    pub fn registry(&self) -> Arc<InMemoryRegistry> {
        self.registry.clone()
    }

    /// Whether the reconciliation task is running.
    pub fn is_syncing(&self) -> bool {
        self.sync.is_some()
    }

    /// Stop background work. In-flight reconciliation finishes first.
    pub async fn shutdown(self) {
        if let Some(sync) = self.sync {
            sync.shutdown().await;
        }
        info!("lora facade node stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use lora_coordination::DevAddr;
    use lora_coordination::DevAddrLookup;
    use lora_coordination::DevEui;
    use lora_coordination::FCntDownResult;
    use lora_coordination::LookupSource;

    use super::*;

    fn seed_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
[[devices]]
dev_eui = "0000000000000001"
dev_addr = "26011234"
primary_credential = "key-1"
"#,
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_start_seeds_registry_and_serves() {
        let seed = seed_file();
        let mut config = FacadeConfig::default();
        config.sync.enabled = false;
        config.registry.seed_file = Some(seed.path().to_path_buf());

        let node = FacadeNode::start(&config).await.unwrap();
        assert!(!node.is_syncing());

        let manager = node.manager();
        match manager.resolve_dev_addr(DevAddr(0x2601_1234)).await.unwrap() {
            DevAddrLookup::Resolved { matches, source } => {
                assert_eq!(source, LookupSource::Registry);
                assert_eq!(matches.len(), 1);
                assert_eq!(matches[0].dev_eui, DevEui(1));
                assert_eq!(matches[0].primary_credential.as_deref(), Some("key-1"));
            }
            DevAddrLookup::Contended => panic!("uncontended lookup"),
        }

        let result = manager.next_fcnt_down(DevEui(1), "gw-a", 1, 0).await.unwrap();
        assert!(matches!(result, FCntDownResult::Issued(_)));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_fills_cache_on_start() {
        let seed = seed_file();
        let mut config = FacadeConfig::default();
        config.registry.seed_file = Some(seed.path().to_path_buf());

        let node = FacadeNode::start(&config).await.unwrap();
        assert!(node.is_syncing());

        // The first pass runs immediately; give it a moment to land.
        let mut synced = false;
        for _ in 0..50 {
            if node.registry().call_counts().list_devices > 0 {
                synced = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(synced);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = FacadeConfig::default();
        config.registry.page_size = 0;
        assert!(FacadeNode::start(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_seed_file() {
        let mut config = FacadeConfig::default();
        config.sync.enabled = false;
        config.registry.seed_file = Some("/nonexistent/devices.toml".into());
        assert!(matches!(FacadeNode::start(&config).await, Err(ConfigError::ReadFile { .. })));
    }
}
