//! Reconciliation of the address cache against the registry.
//!
//! One instance at a time runs a pass, guarded by the non-blocking global lock
//! `globalUpdateKey`. A full pass rebuilds every bucket and runs when the
//! full-sync marker has expired; otherwise a delta pass merges the devices
//! changed since the stored watermark. Each bucket is rewritten under its own
//! address lock, the same lock lookups take.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::AddressLock;
use crate::config::CoordinationConfig;
use crate::config::DevAddrSettings;
use crate::config::SyncSettings;
use crate::error::CacheSnafu;
use crate::error::CoordinationError;
use crate::error::RegistryListingSnafu;
use crate::keys;
use crate::lock::CacheLock;
use crate::registry::collect_pages;
use crate::registry::DeviceRegistry;
use crate::registry::PagedListing;
use crate::registry::RegistryDevice;
use crate::types::DevAddr;
use crate::types::DevAddrBucket;
use crate::verified::devaddr::group_by_address;
use crate::verified::devaddr::merge_registry_device;
use crate::verified::devaddr::rebuild_bucket;

/// Which pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Every bucket rebuilt from the full registry listing.
    Full,
    /// Only devices changed since the watermark merged.
    Delta,
    /// Another instance holds the reconciliation lock.
    Skipped,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Which pass ran.
    pub kind: SyncKind,
    /// Registry devices examined.
    pub devices_seen: usize,
    /// Buckets whose stored contents changed.
    pub buckets_written: usize,
    /// Stale buckets turned into "known empty".
    pub sentinels_written: usize,
    /// Buckets skipped because their address lock was busy.
    pub buckets_contended: usize,
    /// Watermark after the pass.
    pub watermark_ms: Option<u64>,
    /// The registry listing hit the page limit. Nothing was removed and the
    /// marker and watermark were left as they were.
    pub truncated: bool,
}

impl SyncReport {
    fn new(kind: SyncKind, watermark_ms: Option<u64>) -> Self {
        Self {
            kind,
            devices_seen: 0,
            buckets_written: 0,
            sentinels_written: 0,
            buckets_contended: 0,
            watermark_ms,
            truncated: false,
        }
    }
}

enum BucketWrite {
    Unchanged,
    Written,
    Contended,
}

/// Runs reconciliation passes.
pub struct DevAddrReconciler<S: CacheStore + ?Sized, R: DeviceRegistry + ?Sized> {
    store: Arc<S>,
    registry: Arc<R>,
    buckets: AddressLock<S>,
    owner: String,
    devaddr: DevAddrSettings,
    settings: SyncSettings,
}

impl<S, R> DevAddrReconciler<S, R>
where
    S: CacheStore + ?Sized + 'static,
    R: DeviceRegistry + ?Sized,
{
    /// Create a reconciler.
    pub fn new(store: Arc<S>, registry: Arc<R>, config: &CoordinationConfig) -> Self {
        Self {
            buckets: AddressLock::new(store.clone(), config.instance_id.as_str(), &config.devaddr),
            store,
            registry,
            owner: config.instance_id.clone(),
            devaddr: config.devaddr.clone(),
            settings: config.sync.clone(),
        }
    }

    /// Interval the scheduler should run passes at.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.settings.interval_secs)
    }

    /// Run whichever pass is due.
    pub async fn perform_needed_syncs(&self) -> Result<SyncReport, CoordinationError> {
        let lock = CacheLock::new(
            self.store.clone(),
            keys::GLOBAL_UPDATE_KEY,
            self.owner.as_str(),
            Duration::from_secs(self.settings.lock_ttl_secs),
        );
        let Some(guard) = lock.acquire(false).await? else {
            debug!("reconciliation already running elsewhere");
            return Ok(SyncReport::new(SyncKind::Skipped, None));
        };

        let report = self.run_due_pass().await;
        guard.release().await?;

        let report = report?;
        info!(
            kind = ?report.kind,
            devices = report.devices_seen,
            written = report.buckets_written,
            sentinels = report.sentinels_written,
            contended = report.buckets_contended,
            "address cache reconciled"
        );
        Ok(report)
    }

    async fn run_due_pass(&self) -> Result<SyncReport, CoordinationError> {
        let full_due = !self
            .store
            .key_exists(keys::FULL_UPDATE_KEY)
            .await
            .context(CacheSnafu { operation: "read full sync marker" })?;

        match self.read_watermark().await? {
            Some(watermark) if !full_due => self.delta_sync(watermark).await,
            _ => self.full_sync().await,
        }
    }

    async fn full_sync(&self) -> Result<SyncReport, CoordinationError> {
        let listing = self.list(None).await?;
        let mut report = SyncReport::new(SyncKind::Full, max_updated(&listing.devices));
        report.devices_seen = listing.devices.len();

        if listing.truncated {
            // Only additive merges are safe on a partial listing
            report.truncated = true;
            report.watermark_ms = None;
            self.merge_devices(&listing.devices, &mut report).await?;
            warn!(devices = report.devices_seen, "full sync listing truncated, will retry");
            return Ok(report);
        }

        let groups: BTreeMap<DevAddr, Vec<RegistryDevice>> = group_by_address(listing.devices);
        for (dev_addr, members) in &groups {
            let outcome = self
                .with_bucket(*dev_addr, |existing| Some(rebuild_bucket(*dev_addr, members, existing.as_ref())))
                .await?;
            report.count(outcome, false);
        }

        let known: BTreeSet<DevAddr> = groups.keys().copied().collect();
        for dev_addr in self.cached_addresses().await?.into_iter().filter(|a| !known.contains(a)) {
            let outcome = self
                .with_bucket(dev_addr, |existing| match existing {
                    Some(DevAddrBucket::Devices { .. }) => Some(DevAddrBucket::KnownEmpty),
                    _ => None,
                })
                .await?;
            report.count(outcome, true);
        }

        if report.buckets_contended > 0 {
            warn!(contended = report.buckets_contended, "full sync incomplete, will retry");
            return Ok(report);
        }

        let watermark = report.watermark_ms.unwrap_or_default();
        self.write_watermark(watermark).await?;
        self.store
            .string_set(
                keys::FULL_UPDATE_KEY,
                &watermark.to_string(),
                Some(Duration::from_secs(self.settings.full_sync_interval_secs)),
                false,
            )
            .await
            .context(CacheSnafu { operation: "write full sync marker" })?;
        Ok(report)
    }

    async fn delta_sync(&self, watermark: u64) -> Result<SyncReport, CoordinationError> {
        let listing = self.list(Some(watermark)).await?;
        let next = max_updated(&listing.devices).map_or(watermark, |m| m.max(watermark));
        let mut report = SyncReport::new(SyncKind::Delta, Some(watermark));
        report.devices_seen = listing.devices.len();
        report.truncated = listing.truncated;

        self.merge_devices(&listing.devices, &mut report).await?;

        if listing.truncated {
            warn!(devices = report.devices_seen, "delta sync listing truncated, watermark kept");
        } else if report.buckets_contended == 0 && next != watermark {
            self.write_watermark(next).await?;
            report.watermark_ms = Some(next);
        }
        Ok(report)
    }

    async fn merge_devices(&self, devices: &[RegistryDevice], report: &mut SyncReport) -> Result<(), CoordinationError> {
        for device in devices {
            let Some(dev_addr) = device.dev_addr else {
                continue;
            };
            let outcome = self
                .with_bucket(dev_addr, |existing| Some(merge_registry_device(dev_addr, existing, device)))
                .await?;
            report.count(outcome, false);
        }
        Ok(())
    }

    /// Rewrite one bucket under its address lock. `rebuild` returns `None` to
    /// leave the bucket alone.
    async fn with_bucket<F>(&self, dev_addr: DevAddr, rebuild: F) -> Result<BucketWrite, CoordinationError>
    where
        F: FnOnce(Option<DevAddrBucket>) -> Option<DevAddrBucket>,
    {
        let Some(guard) = self.buckets.acquire(dev_addr, true).await? else {
            debug!(%dev_addr, "address lock contended during sync");
            return Ok(BucketWrite::Contended);
        };

        let written = self.rewrite(dev_addr, rebuild).await;
        guard.release().await?;
        written
    }

    async fn rewrite<F>(&self, dev_addr: DevAddr, rebuild: F) -> Result<BucketWrite, CoordinationError>
    where
        F: FnOnce(Option<DevAddrBucket>) -> Option<DevAddrBucket>,
    {
        let existing = self.buckets.read_bucket(dev_addr).await?;
        let Some(bucket) = rebuild(existing.clone()) else {
            return Ok(BucketWrite::Unchanged);
        };
        if self.buckets.write_bucket(dev_addr, &bucket, existing.as_ref()).await? {
            Ok(BucketWrite::Written)
        } else {
            Ok(BucketWrite::Unchanged)
        }
    }

    async fn list(&self, updated_since_ms: Option<u64>) -> Result<PagedListing, CoordinationError> {
        let registry = &self.registry;
        collect_pages(self.devaddr.max_registry_pages, |continuation| {
            registry.list_devices(updated_since_ms, continuation)
        })
        .await
        .context(RegistryListingSnafu { operation: "list devices" })
    }

    async fn cached_addresses(&self) -> Result<Vec<DevAddr>, CoordinationError> {
        let bucket_keys = self
            .store
            .scan_keys(keys::DEVADDR_TABLE_PREFIX)
            .await
            .context(CacheSnafu { operation: "scan address buckets" })?;
        Ok(bucket_keys.iter().filter_map(|k| keys::dev_addr_from_bucket_key(k)).collect())
    }

    async fn read_watermark(&self) -> Result<Option<u64>, CoordinationError> {
        let raw = self
            .store
            .string_get(keys::LAST_DELTA_UPDATE_KEY)
            .await
            .context(CacheSnafu { operation: "read sync watermark" })?;
        Ok(raw.and_then(|value| match value.parse::<u64>() {
            Ok(ms) => Some(ms),
            Err(_) => {
                warn!(value = %value, "unreadable sync watermark, forcing full sync");
                None
            }
        }))
    }

    async fn write_watermark(&self, watermark: u64) -> Result<(), CoordinationError> {
        self.store
            .string_set(keys::LAST_DELTA_UPDATE_KEY, &watermark.to_string(), None, false)
            .await
            .context(CacheSnafu { operation: "write sync watermark" })?;
        Ok(())
    }
}

impl SyncReport {
    fn count(&mut self, outcome: BucketWrite, sentinel: bool) {
        match outcome {
            BucketWrite::Unchanged => {}
            BucketWrite::Written if sentinel => self.sentinels_written += 1,
            BucketWrite::Written => self.buckets_written += 1,
            BucketWrite::Contended => self.buckets_contended += 1,
        }
    }
}

fn max_updated(devices: &[RegistryDevice]) -> Option<u64> {
    devices.iter().map(|d| d.last_updated_ms).max()
}
