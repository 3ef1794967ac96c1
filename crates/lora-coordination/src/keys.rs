//! Cache key layout.
//!
//! Other network-server components read these keys directly, so the formats
//! are fixed.

use crate::types::DevAddr;
use crate::types::DevEui;
use crate::types::DevNonce;

/// Prefix of every address bucket key.
pub const DEVADDR_TABLE_PREFIX: &str = "devAddrTable:";

/// Fleet-wide reconciliation lock.
pub const GLOBAL_UPDATE_KEY: &str = "globalUpdateKey";

/// Present while the last full reconciliation is still considered fresh.
pub const FULL_UPDATE_KEY: &str = "fullUpdateKey";

/// Registry modification time up to which delta reconciliation has run.
pub const LAST_DELTA_UPDATE_KEY: &str = "lastDeltaUpdateKeyValue";

/// Cached `DeviceFrameCounterState`.
pub fn device_state(dev_eui: DevEui) -> String {
    dev_eui.to_string()
}

/// Per-device message lock.
pub fn device_lock(dev_eui: DevEui) -> String {
    format!("{dev_eui}msglock")
}

/// Cached `JoinInfo`.
pub fn join_info(dev_eui: DevEui) -> String {
    format!("{dev_eui}:joininfo")
}

/// Lock guarding population of `JoinInfo`.
pub fn join_info_lock(dev_eui: DevEui) -> String {
    format!("{dev_eui}:joinlockjoininfo")
}

/// Consumed-nonce marker.
pub fn dev_nonce(dev_eui: DevEui, nonce: DevNonce) -> String {
    format!("{dev_eui}:{nonce}")
}

/// Address bucket.
pub fn devaddr_bucket(dev_addr: DevAddr) -> String {
    format!("{DEVADDR_TABLE_PREFIX}{dev_addr}")
}

/// Per-address update lock.
pub fn devaddr_lock(dev_addr: DevAddr) -> String {
    format!("devAddrLock:{dev_addr}")
}

/// Address parsed back out of a bucket key.
pub fn dev_addr_from_bucket_key(key: &str) -> Option<DevAddr> {
    key.strip_prefix(DEVADDR_TABLE_PREFIX)?.parse().ok()
}

/// Elected preferred gateway.
pub fn preferred_gateway(dev_eui: DevEui) -> String {
    format!("preferredGateway:{dev_eui}")
}

/// Candidate gateways for one uplink.
pub fn preferred_gateway_candidates(dev_eui: DevEui, fcnt_up: u32) -> String {
    format!("preferredGateway:{dev_eui}:{fcnt_up}")
}

/// Lock guarding the candidate list for one uplink.
pub fn preferred_gateway_candidates_lock(dev_eui: DevEui, fcnt_up: u32) -> String {
    format!("preferredGateway:{dev_eui}:{fcnt_up}:lock")
}

/// Lock guarding election of the preferred gateway.
pub fn preferred_gateway_lock(dev_eui: DevEui) -> String {
    format!("preferredGateway:{dev_eui}:lock")
}
