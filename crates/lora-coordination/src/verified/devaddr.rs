//! Address bucket construction and merging.
//!
//! A cached entry keeps its lazily fetched credential only while the registry
//! record it was built from is unchanged (same modification time). Any change
//! drops the credential so the next lookup refetches it.

use std::collections::BTreeMap;

use crate::registry::RegistryDevice;
use crate::types::DevAddr;
use crate::types::DevAddrBucket;
use crate::types::DevAddrCacheEntry;

/// Build a cache entry from a registry record, reusing a credential when the
/// record is unchanged since `previous` was cached.
pub fn entry_from_registry(
    dev_addr: DevAddr,
    device: &RegistryDevice,
    previous: Option<&DevAddrCacheEntry>,
) -> DevAddrCacheEntry {
    let primary_credential = previous
        .filter(|prev| prev.dev_eui == device.dev_eui && prev.last_updated_ms == device.last_updated_ms)
        .and_then(|prev| prev.primary_credential.clone());

    DevAddrCacheEntry {
        dev_addr,
        dev_eui: device.dev_eui,
        primary_credential,
        gateway_id: device.gateway_id.clone(),
        network_session_key: device.network_session_key.clone(),
        last_updated_ms: device.last_updated_ms,
    }
}

/// Group registry devices by address. Devices without an address are skipped.
pub fn group_by_address(devices: impl IntoIterator<Item = RegistryDevice>) -> BTreeMap<DevAddr, Vec<RegistryDevice>> {
    let mut groups: BTreeMap<DevAddr, Vec<RegistryDevice>> = BTreeMap::new();
    for device in devices {
        if let Some(dev_addr) = device.dev_addr {
            groups.entry(dev_addr).or_default().push(device);
        }
    }
    groups
}

/// Rebuild a whole bucket from the registry's view of `dev_addr`.
///
/// Entries are ordered by device identity so that rebuilding from an
/// unchanged registry produces an identical bucket.
pub fn rebuild_bucket(dev_addr: DevAddr, devices: &[RegistryDevice], existing: Option<&DevAddrBucket>) -> DevAddrBucket {
    if devices.is_empty() {
        return DevAddrBucket::KnownEmpty;
    }

    let previous = existing.map(DevAddrBucket::entries).unwrap_or_default();
    let mut entries: Vec<DevAddrCacheEntry> = devices
        .iter()
        .map(|device| {
            let prev = previous.iter().find(|e| e.dev_eui == device.dev_eui);
            entry_from_registry(dev_addr, device, prev)
        })
        .collect();
    entries.sort_by_key(|e| e.dev_eui);
    entries.dedup_by_key(|e| e.dev_eui);

    DevAddrBucket::Devices { entries }
}

/// Insert or replace the entry for `entry.dev_eui`, replacing a sentinel.
pub fn upsert_entry(existing: Option<DevAddrBucket>, entry: DevAddrCacheEntry) -> DevAddrBucket {
    let mut entries = match existing {
        Some(DevAddrBucket::Devices { entries }) => entries,
        Some(DevAddrBucket::KnownEmpty) | None => Vec::new(),
    };

    match entries.iter_mut().find(|e| e.dev_eui == entry.dev_eui) {
        Some(slot) => *slot = entry,
        None => entries.push(entry),
    }

    DevAddrBucket::Devices { entries }
}

/// Merge one changed registry record into its bucket.
pub fn merge_registry_device(dev_addr: DevAddr, existing: Option<DevAddrBucket>, device: &RegistryDevice) -> DevAddrBucket {
    let previous = existing.as_ref().and_then(|b| b.entries().iter().find(|e| e.dev_eui == device.dev_eui).cloned());
    let entry = entry_from_registry(dev_addr, device, previous.as_ref());
    upsert_entry(existing, entry)
}
