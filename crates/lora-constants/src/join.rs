//! Join (OTAA) constants.

/// Expiry of the join-info lock (`{DevEUI}:joinlockjoininfo`).
pub const JOIN_INFO_LOCK_TTL_SECS: u64 = 5 * 60;

/// Lifetime of cached `JoinInfo`.
pub const JOIN_INFO_TTL_SECS: u64 = 60 * 60;

/// Lifetime of a consumed DevNonce marker.
pub const DEV_NONCE_TTL_SECS: u64 = 5 * 60;
