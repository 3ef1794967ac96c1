//! Device registry collaborator.
//!
//! The registry is the source of truth for device credentials, gateway
//! affinity and address assignments. The coordination layer only reads from it
//! and caches what it reads.

mod inmemory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::warn;

pub use inmemory::InMemoryRegistry;
pub use inmemory::RegisteredDevice;
pub use inmemory::RegistryCallCounts;

use crate::types::DevAddr;
use crate::types::DevEui;

/// Errors reported by a registry implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// The registry could not be reached.
    #[snafu(display("registry unavailable: {reason}"))]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },

    /// A continuation token was not issued by this registry.
    #[snafu(display("invalid continuation token '{token}'"))]
    InvalidContinuation {
        /// The rejected token.
        token: String,
    },
}

/// Metadata attached to a device in the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwinMetadata {
    /// Gateway the device is pinned to, if any.
    pub gateway_affinity: Option<String>,
    /// Free-form tags.
    pub tags: BTreeMap<String, String>,
}

/// A device as returned by registry queries. Credentials are never included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDevice {
    /// Device identity.
    pub dev_eui: DevEui,
    /// Current session address, if the device has one.
    pub dev_addr: Option<DevAddr>,
    /// Gateway the device is homed on.
    pub gateway_id: Option<String>,
    /// Network session key.
    pub network_session_key: Option<String>,
    /// Last modification time (Unix ms).
    pub last_updated_ms: u64,
}

/// One page of a registry query.
#[derive(Debug, Clone, Default)]
pub struct RegistryPage {
    /// Devices on this page.
    pub devices: Vec<RegistryDevice>,
    /// Token for the next page, absent on the last page.
    pub continuation: Option<String>,
}

/// Read access to the device registry.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Primary credential of a device, `None` if the device is unknown.
    async fn get_primary_credential(&self, dev_eui: DevEui) -> Result<Option<String>, RegistryError>;

    /// Twin metadata of a device, `None` if the device is unknown.
    async fn get_twin_metadata(&self, dev_eui: DevEui) -> Result<Option<TwinMetadata>, RegistryError>;

    /// Devices currently configured with `dev_addr`, one page at a time.
    async fn find_by_dev_addr(
        &self,
        dev_addr: DevAddr,
        continuation: Option<String>,
    ) -> Result<RegistryPage, RegistryError>;

    /// All devices, optionally only those modified after `updated_since_ms`.
    async fn list_devices(
        &self,
        updated_since_ms: Option<u64>,
        continuation: Option<String>,
    ) -> Result<RegistryPage, RegistryError>;
}

/// Devices gathered across pages.
#[derive(Debug, Clone, Default)]
pub(crate) struct PagedListing {
    pub(crate) devices: Vec<RegistryDevice>,
    /// The page limit was hit before the query was exhausted.
    pub(crate) truncated: bool,
}

/// Follow continuation tokens until the query is exhausted or `max_pages` is hit.
pub(crate) async fn collect_pages<F, Fut>(max_pages: u32, mut next_page: F) -> Result<PagedListing, RegistryError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<RegistryPage, RegistryError>>,
{
    let mut devices = Vec::new();
    let mut continuation = None;

    for _ in 0..max_pages {
        let page = next_page(continuation.take()).await?;
        devices.extend(page.devices);
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => {
                return Ok(PagedListing {
                    devices,
                    truncated: false,
                })
            }
        }
    }

    warn!(max_pages, fetched = devices.len(), "registry query truncated at page limit");
    Ok(PagedListing {
        devices,
        truncated: true,
    })
}
