//! Device-address cache constants.

/// Expiry of the per-address update lock (`devAddrLock:{DevAddr}`).
pub const DEVADDR_LOCK_TTL_MS: u64 = 10_000;

/// Expiry of the fleet-wide reconciliation lock.
pub const RECONCILIATION_LOCK_TTL_SECS: u64 = 5 * 60;

/// How long a completed full reconciliation stays valid before the next one.
pub const FULL_SYNC_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Default cadence of the reconciliation scheduler.
pub const SYNC_INTERVAL_SECS: u64 = 5 * 60;

/// Page size requested from the registry for address and device listings.
pub const REGISTRY_PAGE_SIZE: usize = 100;

/// Upper bound on pages followed for one registry query.
pub const MAX_REGISTRY_PAGES: u32 = 10_000;
