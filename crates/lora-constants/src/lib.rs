//! Centralized constants for LoRaWAN device-state coordination.
//!
//! Every TTL, lock expiry and retry bound used by the cache and coordination
//! crates lives here so that operators can see the whole timing envelope in one
//! place. Relationships between the constants are checked at compile time in
//! `assertions`.
//!
//! # Modules
//!
//! - [`cache`]: Lock wait bounds and backoff for the shared cache store
//! - [`device`]: Per-device session lock and state lifetimes
//! - [`join`]: Join-info caching and nonce replay windows
//! - [`devaddr`]: Device-address cache locks, paging and reconciliation cadence
//! - [`gateway`]: Preferred-gateway election window

pub mod cache;
pub mod devaddr;
pub mod device;
pub mod gateway;
pub mod join;

mod assertions;

/// Prelude module for commonly used constants.
pub mod prelude {
    pub use crate::cache::LOCK_WAIT_TIMEOUT_MS;
    pub use crate::devaddr::DEVADDR_LOCK_TTL_MS;
    pub use crate::device::DEVICE_LOCK_TTL_MS;
    pub use crate::device::DEVICE_STATE_TTL_SECS;
    pub use crate::join::DEV_NONCE_TTL_SECS;
    pub use crate::join::JOIN_INFO_TTL_SECS;
}
