//! Error types for device-state coordination.
//!
//! Contention, nonce replay and join rejection are ordinary results, not
//! errors. What remains here is either a collaborator failure (cache,
//! registry) or a broken invariant.

use lora_cache::CacheStoreError;
use snafu::Snafu;

use crate::registry::RegistryError;
use crate::types::DevAddr;
use crate::types::DevEui;

/// Errors from coordination operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The store refused to release a lock we believed we held.
    ///
    /// Either the lock expired and was taken over, or it was released twice.
    /// Exclusivity can no longer be assumed for the work done under it.
    #[snafu(display("lock '{key}' release rejected for owner '{owner}'"))]
    LockReleaseRejected {
        /// The lock key.
        key: String,
        /// Who tried to release it.
        owner: String,
    },

    /// The shared cache failed.
    #[snafu(display("cache error during {operation}: {source}"))]
    Cache {
        /// What was being done.
        operation: String,
        /// The underlying error.
        source: CacheStoreError,
    },

    /// The device registry failed for a device.
    #[snafu(display("registry error during {operation} for device {dev_eui}: {source}"))]
    Registry {
        /// Device being looked up.
        dev_eui: DevEui,
        /// Registry call that failed.
        operation: String,
        /// The underlying error.
        source: RegistryError,
    },

    /// The device registry failed for an address query.
    #[snafu(display("registry error during {operation} for address {dev_addr}: {source}"))]
    RegistryAddress {
        /// Address being queried.
        dev_addr: DevAddr,
        /// Registry call that failed.
        operation: String,
        /// The underlying error.
        source: RegistryError,
    },

    /// The registry failed while listing devices for reconciliation.
    #[snafu(display("registry error during {operation}: {source}"))]
    RegistryListing {
        /// Registry call that failed.
        operation: String,
        /// The underlying error.
        source: RegistryError,
    },

    /// A 32-bit frame counter would wrap.
    #[snafu(display("downlink frame counter exhausted for device {dev_eui} at {fcnt_down}"))]
    CounterExhausted {
        /// Device whose counter is exhausted.
        dev_eui: DevEui,
        /// Last issued counter.
        fcnt_down: u32,
    },

    /// An external decision maker failed.
    #[snafu(display("{component} failed: {reason}"))]
    Collaborator {
        /// Which collaborator.
        component: String,
        /// Description of the failure.
        reason: String,
    },
}

impl CoordinationError {
    /// Whether this error means a lock invariant was violated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoordinationError::LockReleaseRejected { .. })
    }
}
