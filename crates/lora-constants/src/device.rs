//! Per-device session constants.

/// Expiry of the per-device message lock (`{DevEUI}msglock`).
///
/// Short enough that a crashed holder frees the device within one uplink
/// interval of a typical class A device.
pub const DEVICE_LOCK_TTL_MS: u64 = 10_000;

/// Lifetime of cached `DeviceFrameCounterState`.
pub const DEVICE_STATE_TTL_SECS: u64 = 24 * 60 * 60;

/// ABP counter resets only clear a session whose cached `FCntUp` exceeds this.
pub const ABP_RESET_MIN_FCNT_UP: u32 = 1;
