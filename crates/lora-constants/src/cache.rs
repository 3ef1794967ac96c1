//! Shared cache store bounds.

/// Upper bound on how long a blocking lock take waits before giving up.
pub const LOCK_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Initial backoff between blocking lock take attempts.
pub const LOCK_INITIAL_BACKOFF_MS: u64 = 10;

/// Maximum backoff between blocking lock take attempts.
pub const LOCK_MAX_BACKOFF_MS: u64 = 500;

/// Schema version written into every cached record envelope.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Maximum number of keys a single prefix scan may return.
pub const MAX_SCAN_KEYS: usize = 100_000;
