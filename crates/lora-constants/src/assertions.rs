//! Compile-time constant assertions.
//!
//! Each assertion verifies a relationship between constants that must hold
//! for correct coordination.

use super::cache::*;
use super::devaddr::*;
use super::device::*;
use super::gateway::*;
use super::join::*;

// ============================================================================
// Lock waits
// ============================================================================
// A blocking waiter must be able to outlast at least one full lock expiry,
// otherwise a crashed holder would starve every waiter.

const _: () = assert!(LOCK_INITIAL_BACKOFF_MS > 0);
const _: () = assert!(LOCK_INITIAL_BACKOFF_MS <= LOCK_MAX_BACKOFF_MS);
const _: () = assert!(LOCK_MAX_BACKOFF_MS < LOCK_WAIT_TIMEOUT_MS);
const _: () = assert!(DEVICE_LOCK_TTL_MS <= LOCK_WAIT_TIMEOUT_MS);
const _: () = assert!(DEVADDR_LOCK_TTL_MS <= LOCK_WAIT_TIMEOUT_MS);

// ============================================================================
// Record lifetimes
// ============================================================================

// Locks must expire long before the state they guard.
const _: () = assert!(DEVICE_LOCK_TTL_MS / 1000 < DEVICE_STATE_TTL_SECS);
const _: () = assert!(JOIN_INFO_LOCK_TTL_SECS < JOIN_INFO_TTL_SECS);

// A nonce marker outlives any plausible relay of the same join frame.
const _: () = assert!(DEV_NONCE_TTL_SECS >= 60);

// ============================================================================
// Reconciliation
// ============================================================================

const _: () = assert!(SYNC_INTERVAL_SECS > 0);
const _: () = assert!(SYNC_INTERVAL_SECS < FULL_SYNC_INTERVAL_SECS);
const _: () = assert!(RECONCILIATION_LOCK_TTL_SECS <= FULL_SYNC_INTERVAL_SECS);
const _: () = assert!(REGISTRY_PAGE_SIZE > 0);
const _: () = assert!(MAX_REGISTRY_PAGES > 0);
const _: () = assert!(MAX_SCAN_KEYS > 0);

// ============================================================================
// Preferred gateway
// ============================================================================

const _: () = assert!(RECEIVE_WINDOW_MS < PREFERRED_GATEWAY_LOCK_TTL_MS);
const _: () = assert!(RECEIVE_WINDOW_MS / 1000 < CANDIDATE_TTL_SECS);
const _: () = assert!(MAX_RESOLUTION_ATTEMPTS > 0);
const _: () = assert!(CACHE_SCHEMA_VERSION > 0);
