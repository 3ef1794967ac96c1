//! Shared cache store contract for LoRaWAN device-state coordination.
//!
//! Every gateway process talks to the same cache. This crate defines what that
//! cache must provide and nothing more:
//!
//! - [`CacheStore`] - atomic string get/set-if-absent, key existence and
//!   deletion, prefix scans, and an owner-scoped lock primitive with expiry
//! - [`CacheStoreExt`] - typed object access through a versioned envelope
//!   ([`CachedRecord`])
//! - [`DeterministicCacheStore`] - an in-memory implementation with TTLs on
//!   the tokio clock, used by tests and the development node
//!
//! ## Example
//!
//! ```ignore
//! use lora_cache::{CacheStore, DeterministicCacheStore};
//!
//! let store = DeterministicCacheStore::new();
//! if store.lock_take("0000000000000001msglock", "gw-1", ttl, true).await? {
//!     // critical section
//!     store.lock_release("0000000000000001msglock", "gw-1").await?;
//! }
//! ```

mod config;
mod error;
mod inmemory;
mod record;
mod store;
pub mod verified;

pub use config::LockWaitConfig;
pub use error::CacheStoreError;
pub use error::CorruptedDataSnafu;
pub use error::InvalidKeySnafu;
pub use error::SerializationSnafu;
pub use error::UnavailableSnafu;
pub use inmemory::DeterministicCacheStore;
pub use record::CacheStoreExt;
pub use record::CachedRecord;
pub use store::CacheStore;
