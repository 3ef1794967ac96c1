//! In-memory device registry with call accounting and failure injection.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use super::DeviceRegistry;
use super::RegistryDevice;
use super::RegistryError;
use super::RegistryPage;
use super::TwinMetadata;
use crate::types::now_unix_ms;
use crate::types::DevAddr;
use crate::types::DevEui;

/// A device record held by [`InMemoryRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    /// Device identity.
    pub dev_eui: DevEui,
    /// Session address (ABP devices, or OTAA devices after join).
    #[serde(default)]
    pub dev_addr: Option<DevAddr>,
    /// Primary credential.
    #[serde(default)]
    pub primary_credential: Option<String>,
    /// Gateway the device is pinned to.
    #[serde(default)]
    pub gateway_id: Option<String>,
    /// Network session key.
    #[serde(default)]
    pub network_session_key: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Assigned by the registry on every upsert.
    #[serde(default, skip_deserializing)]
    pub last_updated_ms: u64,
}

impl RegisteredDevice {
    /// A device with a credential and nothing else.
    pub fn new(dev_eui: DevEui, primary_credential: impl Into<String>) -> Self {
        Self {
            dev_eui,
            dev_addr: None,
            primary_credential: Some(primary_credential.into()),
            gateway_id: None,
            network_session_key: None,
            tags: BTreeMap::new(),
            last_updated_ms: 0,
        }
    }

    /// Set the session address.
    pub fn with_dev_addr(mut self, dev_addr: DevAddr) -> Self {
        self.dev_addr = Some(dev_addr);
        self
    }

    /// Pin the device to a gateway.
    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    /// Set the network session key.
    pub fn with_network_session_key(mut self, key: impl Into<String>) -> Self {
        self.network_session_key = Some(key.into());
        self
    }

    fn to_query_result(&self) -> RegistryDevice {
        RegistryDevice {
            dev_eui: self.dev_eui,
            dev_addr: self.dev_addr,
            gateway_id: self.gateway_id.clone(),
            network_session_key: self.network_session_key.clone(),
            last_updated_ms: self.last_updated_ms,
        }
    }
}

/// Number of calls made against an [`InMemoryRegistry`], per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCallCounts {
    /// `get_primary_credential` calls.
    pub credential: u64,
    /// `get_twin_metadata` calls.
    pub twin: u64,
    /// `find_by_dev_addr` calls (one per page).
    pub find_by_dev_addr: u64,
    /// `list_devices` calls (one per page).
    pub list_devices: u64,
}

#[derive(Default)]
struct CallCounters {
    credential: AtomicU64,
    twin: AtomicU64,
    find_by_dev_addr: AtomicU64,
    list_devices: AtomicU64,
}

/// A registry kept in memory.
///
/// Every upsert stamps the device with a strictly increasing modification
/// time, so delta queries behave like the real registry's.
pub struct InMemoryRegistry {
    devices: RwLock<BTreeMap<DevEui, RegisteredDevice>>,
    last_stamp: AtomicU64,
    page_size: usize,
    calls: CallCounters,
    unavailable: AtomicBool,
}

impl InMemoryRegistry {
    /// Create an empty registry wrapped in Arc.
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(BTreeMap::new()),
            last_stamp: AtomicU64::new(0),
            page_size: page_size.max(1),
            calls: CallCounters::default(),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Insert or replace a device. Returns the assigned modification time.
    pub async fn upsert(&self, mut device: RegisteredDevice) -> u64 {
        let mut devices = self.devices.write().await;
        let stamp = now_unix_ms().max(self.last_stamp.load(Ordering::SeqCst).saturating_add(1));
        self.last_stamp.store(stamp, Ordering::SeqCst);
        device.last_updated_ms = stamp;
        devices.insert(device.dev_eui, device);
        stamp
    }

    /// Remove a device. Returns whether it existed.
    pub async fn remove(&self, dev_eui: DevEui) -> bool {
        self.devices.write().await.remove(&dev_eui).is_some()
    }

    /// Make every call fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Calls made so far.
    pub fn call_counts(&self) -> RegistryCallCounts {
        RegistryCallCounts {
            credential: self.calls.credential.load(Ordering::SeqCst),
            twin: self.calls.twin.load(Ordering::SeqCst),
            find_by_dev_addr: self.calls.find_by_dev_addr.load(Ordering::SeqCst),
            list_devices: self.calls.list_devices.load(Ordering::SeqCst),
        }
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable {
                reason: "registry offline".to_string(),
            });
        }
        Ok(())
    }

    fn page(&self, matching: Vec<RegistryDevice>, continuation: Option<String>) -> Result<RegistryPage, RegistryError> {
        let offset = match continuation {
            Some(token) => token.parse::<usize>().map_err(|_| RegistryError::InvalidContinuation { token })?,
            None => 0,
        };
        let end = offset.saturating_add(self.page_size).min(matching.len());
        let devices = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let continuation = (end < matching.len()).then(|| end.to_string());
        Ok(RegistryPage { devices, continuation })
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn get_primary_credential(&self, dev_eui: DevEui) -> Result<Option<String>, RegistryError> {
        self.calls.credential.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.devices.read().await.get(&dev_eui).and_then(|d| d.primary_credential.clone()))
    }

    async fn get_twin_metadata(&self, dev_eui: DevEui) -> Result<Option<TwinMetadata>, RegistryError> {
        self.calls.twin.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.devices.read().await.get(&dev_eui).map(|d| TwinMetadata {
            gateway_affinity: d.gateway_id.clone(),
            tags: d.tags.clone(),
        }))
    }

    async fn find_by_dev_addr(
        &self,
        dev_addr: DevAddr,
        continuation: Option<String>,
    ) -> Result<RegistryPage, RegistryError> {
        self.calls.find_by_dev_addr.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let matching = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.dev_addr == Some(dev_addr))
            .map(RegisteredDevice::to_query_result)
            .collect();
        self.page(matching, continuation)
    }

    async fn list_devices(
        &self,
        updated_since_ms: Option<u64>,
        continuation: Option<String>,
    ) -> Result<RegistryPage, RegistryError> {
        self.calls.list_devices.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let matching = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| updated_since_ms.is_none_or(|since| d.last_updated_ms > since))
            .map(RegisteredDevice::to_query_result)
            .collect();
        self.page(matching, continuation)
    }
}
