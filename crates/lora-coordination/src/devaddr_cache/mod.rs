//! Device-Address Cache.
//!
//! Maps a 32-bit session address to the devices currently using it, so that
//! ABP uplinks can be matched without a registry query per frame. Every bucket
//! mutation happens under the per-address lock `devAddrLock:{DevAddr}`; both
//! per-address lookups and the reconciliation pass go through [`AddressLock`].

mod sync;

use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use lora_cache::CacheStoreExt;
use snafu::ResultExt;
use tracing::debug;
use tracing::warn;

pub use sync::DevAddrReconciler;
pub use sync::SyncKind;
pub use sync::SyncReport;

use crate::config::CoordinationConfig;
use crate::config::DevAddrSettings;
use crate::error::CacheSnafu;
use crate::error::CoordinationError;
use crate::error::RegistryAddressSnafu;
use crate::error::RegistrySnafu;
use crate::keys;
use crate::lock::CacheLock;
use crate::lock::CacheLockGuard;
use crate::registry::collect_pages;
use crate::registry::DeviceRegistry;
use crate::types::now_unix_ms;
use crate::types::DevAddr;
use crate::types::DevAddrBucket;
use crate::types::DevAddrCacheEntry;
use crate::types::DevEui;
use crate::verified::devaddr::rebuild_bucket;
use crate::verified::devaddr::upsert_entry;

/// Where a lookup's answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    /// An existing bucket (possibly with credentials filled in).
    Cache,
    /// A registry query that populated the bucket.
    Registry,
}

/// Result of resolving an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevAddrLookup {
    /// Devices using the address. Empty when none does.
    Resolved {
        /// Matching devices, never containing a sentinel.
        matches: Vec<DevAddrCacheEntry>,
        /// Where the answer came from.
        source: LookupSource,
    },
    /// The address lock could not be taken.
    Contended,
}

impl DevAddrLookup {
    /// Matching devices; empty for contention.
    pub fn matches(&self) -> &[DevAddrCacheEntry] {
        match self {
            DevAddrLookup::Resolved { matches, .. } => matches,
            DevAddrLookup::Contended => &[],
        }
    }
}

/// Device reported by the network server after a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedDevice {
    /// The address assigned by the join.
    pub dev_addr: DevAddr,
    /// Device identity.
    pub dev_eui: DevEui,
    /// Gateway that handled the join.
    pub gateway_id: Option<String>,
    /// Session key derived by the join.
    pub network_session_key: Option<String>,
    /// Credential, when the caller already has it.
    pub primary_credential: Option<String>,
}

/// Per-address lock plus bucket I/O, shared by lookups and reconciliation.
pub(crate) struct AddressLock<S: CacheStore + ?Sized> {
    store: Arc<S>,
    owner: String,
    ttl: Duration,
}

impl<S: CacheStore + ?Sized + 'static> AddressLock<S> {
    pub(crate) fn new(store: Arc<S>, owner: impl Into<String>, settings: &DevAddrSettings) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl: Duration::from_millis(settings.lock_ttl_ms),
        }
    }

    pub(crate) async fn acquire(
        &self,
        dev_addr: DevAddr,
        blocking: bool,
    ) -> Result<Option<CacheLockGuard<S>>, CoordinationError> {
        CacheLock::new(self.store.clone(), keys::devaddr_lock(dev_addr), self.owner.as_str(), self.ttl)
            .acquire(blocking)
            .await
    }

    pub(crate) async fn read_bucket(&self, dev_addr: DevAddr) -> Result<Option<DevAddrBucket>, CoordinationError> {
        self.store
            .object_get(&keys::devaddr_bucket(dev_addr))
            .await
            .context(CacheSnafu { operation: "read address bucket" })
    }

    /// Write a bucket. Returns false when the stored bucket already equals it.
    pub(crate) async fn write_bucket(
        &self,
        dev_addr: DevAddr,
        bucket: &DevAddrBucket,
        current: Option<&DevAddrBucket>,
    ) -> Result<bool, CoordinationError> {
        if current == Some(bucket) {
            return Ok(false);
        }
        self.store
            .object_set(&keys::devaddr_bucket(dev_addr), bucket, None, false)
            .await
            .context(CacheSnafu { operation: "write address bucket" })?;
        Ok(true)
    }
}

/// Address-to-device lookup with lazy population from the registry.
pub struct DevAddrCache<S: CacheStore + ?Sized, R: DeviceRegistry + ?Sized> {
    buckets: AddressLock<S>,
    registry: Arc<R>,
    settings: DevAddrSettings,
}

impl<S, R> DevAddrCache<S, R>
where
    S: CacheStore + ?Sized + 'static,
    R: DeviceRegistry + ?Sized,
{
    /// Create a cache view over `store`.
    pub fn new(store: Arc<S>, registry: Arc<R>, config: &CoordinationConfig) -> Self {
        Self {
            buckets: AddressLock::new(store, config.instance_id.as_str(), &config.devaddr),
            registry,
            settings: config.devaddr.clone(),
        }
    }

    /// Devices currently using `dev_addr`.
    ///
    /// The first lookup of an address queries the registry and caches the
    /// answer, including a "known empty" answer. Later lookups are served from
    /// the bucket, fetching missing credentials on the way.
    pub async fn resolve(&self, dev_addr: DevAddr) -> Result<DevAddrLookup, CoordinationError> {
        let Some(guard) = self.buckets.acquire(dev_addr, true).await? else {
            debug!(%dev_addr, "address lock contended");
            return Ok(DevAddrLookup::Contended);
        };

        let lookup = self.resolve_locked(dev_addr).await;
        guard.release().await?;
        lookup
    }

    async fn resolve_locked(&self, dev_addr: DevAddr) -> Result<DevAddrLookup, CoordinationError> {
        if let Some(bucket) = self.buckets.read_bucket(dev_addr).await? {
            let matches = self.fill_credentials(dev_addr, bucket).await?;
            return Ok(DevAddrLookup::Resolved {
                matches,
                source: LookupSource::Cache,
            });
        }

        let registry = &self.registry;
        let listing = collect_pages(self.settings.max_registry_pages, |continuation| {
            registry.find_by_dev_addr(dev_addr, continuation)
        })
        .await
        .context(RegistryAddressSnafu {
            dev_addr,
            operation: "find by dev addr",
        })?;

        let mut bucket = rebuild_bucket(dev_addr, &listing.devices, None);
        if let DevAddrBucket::Devices { entries } = &mut bucket {
            for entry in entries.iter_mut() {
                entry.primary_credential = self.fetch_credential(entry.dev_eui).await?;
            }
        }
        if listing.truncated {
            // A partial answer is served but never cached
            warn!(%dev_addr, matches = bucket.entries().len(), "address query truncated, bucket not cached");
        } else {
            self.buckets.write_bucket(dev_addr, &bucket, None).await?;
            debug!(%dev_addr, matches = bucket.entries().len(), "address bucket populated from registry");
        }

        Ok(DevAddrLookup::Resolved {
            matches: bucket.entries().to_vec(),
            source: LookupSource::Registry,
        })
    }

    async fn fill_credentials(
        &self,
        dev_addr: DevAddr,
        bucket: DevAddrBucket,
    ) -> Result<Vec<DevAddrCacheEntry>, CoordinationError> {
        let DevAddrBucket::Devices { mut entries } = bucket else {
            return Ok(Vec::new());
        };

        let mut filled = 0usize;
        for entry in entries.iter_mut().filter(|e| e.primary_credential.is_none()) {
            if let Some(credential) = self.fetch_credential(entry.dev_eui).await? {
                entry.primary_credential = Some(credential);
                filled += 1;
            }
        }

        if filled == 0 {
            return Ok(entries);
        }

        let bucket = DevAddrBucket::Devices { entries };
        self.buckets.write_bucket(dev_addr, &bucket, None).await?;
        debug!(%dev_addr, filled, "address bucket credentials filled");
        Ok(bucket.entries().to_vec())
    }

    async fn fetch_credential(&self, dev_eui: DevEui) -> Result<Option<String>, CoordinationError> {
        self.registry.get_primary_credential(dev_eui).await.context(RegistrySnafu {
            dev_eui,
            operation: "get primary credential",
        })
    }

    /// Record a device that just joined with `device.dev_addr`.
    ///
    /// Replaces a "known empty" sentinel and any previous entry for the same
    /// device. Returns false when the address lock could not be taken.
    pub async fn add_device(&self, device: JoinedDevice) -> Result<bool, CoordinationError> {
        let dev_addr = device.dev_addr;
        let Some(guard) = self.buckets.acquire(dev_addr, true).await? else {
            debug!(%dev_addr, dev_eui = %device.dev_eui, "address lock contended, join not recorded");
            return Ok(false);
        };

        let stored = self.store_joined(device).await;
        guard.release().await?;
        stored.map(|()| true)
    }

    async fn store_joined(&self, device: JoinedDevice) -> Result<(), CoordinationError> {
        let dev_addr = device.dev_addr;
        let dev_eui = device.dev_eui;
        let existing = self.buckets.read_bucket(dev_addr).await?;
        let entry = DevAddrCacheEntry {
            dev_addr,
            dev_eui,
            primary_credential: device.primary_credential,
            gateway_id: device.gateway_id,
            network_session_key: device.network_session_key,
            last_updated_ms: now_unix_ms(),
        };
        let bucket = upsert_entry(existing.clone(), entry);
        self.buckets.write_bucket(dev_addr, &bucket, existing.as_ref()).await?;
        debug!(%dev_addr, %dev_eui, "joined device added to address bucket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lora_cache::DeterministicCacheStore;

    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::registry::RegisteredDevice;

    const ADDR: DevAddr = DevAddr(0x2600_0001);

    fn cache(
        store: &Arc<DeterministicCacheStore>,
        registry: &Arc<InMemoryRegistry>,
    ) -> DevAddrCache<DeterministicCacheStore, InMemoryRegistry> {
        DevAddrCache::new(store.clone(), registry.clone(), &CoordinationConfig::default())
    }

    #[tokio::test]
    async fn test_sentinel_short_circuits_registry() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(10);
        let cache = cache(&store, &registry);

        let first = cache.resolve(ADDR).await.unwrap();
        assert_eq!(first, DevAddrLookup::Resolved {
            matches: Vec::new(),
            source: LookupSource::Registry,
        });
        let second = cache.resolve(ADDR).await.unwrap();
        assert_eq!(second, DevAddrLookup::Resolved {
            matches: Vec::new(),
            source: LookupSource::Cache,
        });
        assert_eq!(registry.call_counts().find_by_dev_addr, 1);

        let bucket: Option<DevAddrBucket> = store.object_get(&keys::devaddr_bucket(ADDR)).await.unwrap();
        assert_eq!(bucket, Some(DevAddrBucket::KnownEmpty));
        assert!(!store.key_exists(&keys::devaddr_lock(ADDR)).await.unwrap());
    }

    #[tokio::test]
    async fn test_colliding_devices_paginated() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(1);
        for eui in [3u64, 1, 2] {
            registry.upsert(RegisteredDevice::new(DevEui(eui), format!("key-{eui}")).with_dev_addr(ADDR)).await;
        }
        registry.upsert(RegisteredDevice::new(DevEui(9), "other").with_dev_addr(DevAddr(7))).await;
        let cache = cache(&store, &registry);

        let lookup = cache.resolve(ADDR).await.unwrap();
        let euis: Vec<u64> = lookup.matches().iter().map(|m| m.dev_eui.0).collect();
        assert_eq!(euis, vec![1, 2, 3]);
        assert!(lookup.matches().iter().all(|m| m.primary_credential.is_some()));
        assert_eq!(registry.call_counts().find_by_dev_addr, 3);
    }

    #[tokio::test]
    async fn test_missing_credential_filled_lazily() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(10);
        registry.upsert(RegisteredDevice::new(DevEui(5), "k5")).await;
        let cache = cache(&store, &registry);

        assert!(cache
            .add_device(JoinedDevice {
                dev_addr: ADDR,
                dev_eui: DevEui(5),
                gateway_id: Some("gw".to_string()),
                network_session_key: Some("nwk".to_string()),
                primary_credential: None,
            })
            .await
            .unwrap());

        let lookup = cache.resolve(ADDR).await.unwrap();
        assert_eq!(lookup.matches()[0].primary_credential.as_deref(), Some("k5"));
        assert_eq!(registry.call_counts().find_by_dev_addr, 0);

        cache.resolve(ADDR).await.unwrap();
        assert_eq!(registry.call_counts().credential, 1);
    }

    #[tokio::test]
    async fn test_add_device_replaces_sentinel() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(10);
        let cache = cache(&store, &registry);
        cache.resolve(ADDR).await.unwrap();

        cache
            .add_device(JoinedDevice {
                dev_addr: ADDR,
                dev_eui: DevEui(8),
                gateway_id: None,
                network_session_key: None,
                primary_credential: Some("k8".to_string()),
            })
            .await
            .unwrap();
        let lookup = cache.resolve(ADDR).await.unwrap();
        assert_eq!(lookup.matches().len(), 1);
        assert_eq!(lookup.matches()[0].dev_eui, DevEui(8));
    }

    #[tokio::test]
    async fn test_registry_failure_releases_lock() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(10);
        registry.set_unavailable(true);
        let cache = cache(&store, &registry);

        let err = cache.resolve(ADDR).await.unwrap_err();
        assert!(matches!(err, CoordinationError::RegistryAddress { dev_addr: ADDR, .. }));
        assert!(!store.key_exists(&keys::devaddr_lock(ADDR)).await.unwrap());
        assert!(!store.key_exists(&keys::devaddr_bucket(ADDR)).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_query_not_cached() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(1);
        for eui in 1..=2 {
            registry.upsert(RegisteredDevice::new(DevEui(eui), "key").with_dev_addr(ADDR)).await;
        }
        let mut config = CoordinationConfig::default();
        config.devaddr.max_registry_pages = 1;
        let cache = DevAddrCache::new(store.clone(), registry.clone(), &config);

        let lookup = cache.resolve(ADDR).await.unwrap();
        assert_eq!(lookup.matches().len(), 1);
        assert!(!store.key_exists(&keys::devaddr_bucket(ADDR)).await.unwrap());
        assert!(!store.key_exists(&keys::devaddr_lock(ADDR)).await.unwrap());
    }
}
