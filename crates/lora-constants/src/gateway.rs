//! Preferred-gateway election constants.

/// How long candidates for one uplink are collected before electing a winner.
pub const RECEIVE_WINDOW_MS: u64 = 200;

/// Lifetime of the candidate list for one `(DevEUI, FCntUp)`.
pub const CANDIDATE_TTL_SECS: u64 = 2 * 60;

/// Expiry of the candidate list and resolution locks.
pub const PREFERRED_GATEWAY_LOCK_TTL_MS: u64 = 5_000;

/// Lifetime of the elected preferred gateway record.
pub const PREFERRED_GATEWAY_TTL_SECS: u64 = 24 * 60 * 60;

/// Attempts to take the resolution lock before reporting an error.
pub const MAX_RESOLUTION_ATTEMPTS: u32 = 5;
