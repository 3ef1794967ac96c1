//! Configuration for the coordination layer.
//!
//! All timing knobs are explicit and passed into constructors; nothing here is
//! process-global.

use std::time::Duration;

use lora_constants::devaddr::DEVADDR_LOCK_TTL_MS;
use lora_constants::devaddr::FULL_SYNC_INTERVAL_SECS;
use lora_constants::devaddr::MAX_REGISTRY_PAGES;
use lora_constants::devaddr::RECONCILIATION_LOCK_TTL_SECS;
use lora_constants::devaddr::SYNC_INTERVAL_SECS;
use lora_constants::device::ABP_RESET_MIN_FCNT_UP;
use lora_constants::device::DEVICE_LOCK_TTL_MS;
use lora_constants::device::DEVICE_STATE_TTL_SECS;
use lora_constants::gateway::CANDIDATE_TTL_SECS;
use lora_constants::gateway::MAX_RESOLUTION_ATTEMPTS;
use lora_constants::gateway::PREFERRED_GATEWAY_LOCK_TTL_MS;
use lora_constants::gateway::PREFERRED_GATEWAY_TTL_SECS;
use lora_constants::gateway::RECEIVE_WINDOW_MS;
use lora_constants::join::DEV_NONCE_TTL_SECS;
use lora_constants::join::JOIN_INFO_LOCK_TTL_SECS;
use lora_constants::join::JOIN_INFO_TTL_SECS;

/// Per-device lock and state lifetimes.
#[derive(Debug, Clone)]
pub struct DeviceLockSettings {
    /// Device lock expiry in milliseconds.
    pub lock_ttl_ms: u64,
    /// Cached session state lifetime in seconds.
    pub state_ttl_secs: u64,
    /// ABP resets clear the session only above this cached `FCntUp`.
    pub abp_reset_min_fcnt_up: u32,
}

impl Default for DeviceLockSettings {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEVICE_LOCK_TTL_MS,
            state_ttl_secs: DEVICE_STATE_TTL_SECS,
            abp_reset_min_fcnt_up: ABP_RESET_MIN_FCNT_UP,
        }
    }
}

impl DeviceLockSettings {
    pub(crate) fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub(crate) fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

/// Join-info caching and nonce replay windows.
#[derive(Debug, Clone)]
pub struct JoinSettings {
    /// Join-info lock expiry in seconds.
    pub info_lock_ttl_secs: u64,
    /// Cached join-info lifetime in seconds.
    pub info_ttl_secs: u64,
    /// Consumed-nonce marker lifetime in seconds.
    pub nonce_ttl_secs: u64,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            info_lock_ttl_secs: JOIN_INFO_LOCK_TTL_SECS,
            info_ttl_secs: JOIN_INFO_TTL_SECS,
            nonce_ttl_secs: DEV_NONCE_TTL_SECS,
        }
    }
}

/// Device-address cache locking.
#[derive(Debug, Clone)]
pub struct DevAddrSettings {
    /// Per-address lock expiry in milliseconds.
    pub lock_ttl_ms: u64,
    /// Upper bound on registry pages followed per query.
    pub max_registry_pages: u32,
}

impl Default for DevAddrSettings {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEVADDR_LOCK_TTL_MS,
            max_registry_pages: MAX_REGISTRY_PAGES,
        }
    }
}

/// Reconciliation cadence.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How often the scheduler runs reconciliation, in seconds.
    pub interval_secs: u64,
    /// How long a full reconciliation stays fresh, in seconds.
    pub full_sync_interval_secs: u64,
    /// Reconciliation lock expiry in seconds.
    pub lock_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: SYNC_INTERVAL_SECS,
            full_sync_interval_secs: FULL_SYNC_INTERVAL_SECS,
            lock_ttl_secs: RECONCILIATION_LOCK_TTL_SECS,
        }
    }
}

/// Preferred-gateway election.
#[derive(Debug, Clone)]
pub struct PreferredGatewaySettings {
    /// Candidate collection window in milliseconds.
    pub receive_window_ms: u64,
    /// Candidate list lifetime in seconds.
    pub candidate_ttl_secs: u64,
    /// Elected record lifetime in seconds.
    pub record_ttl_secs: u64,
    /// Candidate and resolution lock expiry in milliseconds.
    pub lock_ttl_ms: u64,
    /// Attempts to take the resolution lock.
    pub max_resolution_attempts: u32,
}

impl Default for PreferredGatewaySettings {
    fn default() -> Self {
        Self {
            receive_window_ms: RECEIVE_WINDOW_MS,
            candidate_ttl_secs: CANDIDATE_TTL_SECS,
            record_ttl_secs: PREFERRED_GATEWAY_TTL_SECS,
            lock_ttl_ms: PREFERRED_GATEWAY_LOCK_TTL_MS,
            max_resolution_attempts: MAX_RESOLUTION_ATTEMPTS,
        }
    }
}

/// Configuration for every coordination component of one process.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Identifier of this process, used as lock owner for work not tied to a
    /// gateway (reconciliation, administrative resets).
    pub instance_id: String,
    /// Device lock settings.
    pub device: DeviceLockSettings,
    /// Join settings.
    pub join: JoinSettings,
    /// Address cache settings.
    pub devaddr: DevAddrSettings,
    /// Reconciliation settings.
    pub sync: SyncSettings,
    /// Preferred gateway settings.
    pub preferred_gateway: PreferredGatewaySettings,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            instance_id: "lora-facade".to_string(),
            device: DeviceLockSettings::default(),
            join: JoinSettings::default(),
            devaddr: DevAddrSettings::default(),
            sync: SyncSettings::default(),
            preferred_gateway: PreferredGatewaySettings::default(),
        }
    }
}
