//! Frame-Counter Arbitrator.
//!
//! Computes the next downlink frame counter for a device under its device
//! lock, so that exactly one gateway schedules a downlink for each uplink.

use std::sync::Arc;

use lora_cache::CacheStore;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CoordinationConfig;
use crate::config::DeviceLockSettings;
use crate::device_lock::DeviceLockGuard;
use crate::device_lock::DeviceLockSession;
use crate::error::CoordinationError;
use crate::error::CounterExhaustedSnafu;
use crate::types::DevEui;
use crate::verified::fcnt::decide_next_fcnt_down;
use crate::verified::fcnt::should_reset_abp_session;
use crate::verified::fcnt::FCntDownDecision;

/// Result of asking for the next downlink counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCntDownResult {
    /// Downlink counter to use.
    Issued(u32),
    /// Another gateway owns this exchange (or the uplink is stale): do not
    /// send a downlink.
    NotOwner,
    /// The device lock could not be taken. Nothing was changed; retry or fail
    /// the request.
    Contended,
}

impl FCntDownResult {
    /// Value for the wire protocol, where `0` means "no downlink".
    ///
    /// `None` for contention, which has no wire representation.
    pub fn wire_value(self) -> Option<u32> {
        match self {
            FCntDownResult::Issued(fcnt_down) => Some(fcnt_down),
            FCntDownResult::NotOwner => Some(0),
            FCntDownResult::Contended => None,
        }
    }
}

/// Result of a session reset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The cached session was removed.
    Cleared,
    /// Nothing was removed (no session, or the reset guard declined).
    Skipped,
    /// The device lock could not be taken.
    Contended,
}

/// Arbitrates downlink frame counters across gateways.
pub struct FrameCounterArbitrator<S: CacheStore + ?Sized> {
    locks: DeviceLockSession<S>,
    settings: DeviceLockSettings,
    instance_id: String,
}

impl<S: CacheStore + ?Sized + 'static> FrameCounterArbitrator<S> {
    /// Create an arbitrator over `store`.
    pub fn new(store: Arc<S>, config: &CoordinationConfig) -> Self {
        Self {
            locks: DeviceLockSession::new(store, config.device.clone()),
            settings: config.device.clone(),
            instance_id: config.instance_id.clone(),
        }
    }

    /// Next downlink counter for an uplink observed by `gateway_id`.
    ///
    /// Waits for the device lock up to the store's bound. A 32-bit overflow is
    /// reported as [`CoordinationError::CounterExhausted`]; narrowing to the
    /// 16-bit wire field is the frame encoder's concern.
    pub async fn next_fcnt_down(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        observed_up: u32,
        observed_down: u32,
    ) -> Result<FCntDownResult, CoordinationError> {
        let Some(guard) = self.locks.acquire(dev_eui, gateway_id, true).await? else {
            warn!(%dev_eui, gateway_id, "device lock contended, no downlink counter issued");
            return Ok(FCntDownResult::Contended);
        };

        let outcome = Self::arbitrate(&guard, gateway_id, observed_up, observed_down).await;
        guard.release().await?;
        outcome
    }

    /// Clear the session for an ABP device whose counters were reset, unless
    /// the cached `FCntUp` shows the session was just restarted.
    pub async fn abp_fcnt_cache_reset(&self, dev_eui: DevEui, gateway_id: &str) -> Result<ResetOutcome, CoordinationError> {
        let Some(guard) = self.locks.acquire(dev_eui, gateway_id, true).await? else {
            warn!(%dev_eui, gateway_id, "device lock contended, ABP reset skipped");
            return Ok(ResetOutcome::Contended);
        };

        let outcome = self.reset_if_started(&guard).await;
        guard.release().await?;
        outcome
    }

    /// Evict a device's session unconditionally (administrative reset).
    pub async fn clear_device_cache(&self, dev_eui: DevEui) -> Result<ResetOutcome, CoordinationError> {
        let Some(guard) = self.locks.acquire(dev_eui, &self.instance_id, true).await? else {
            warn!(%dev_eui, "device lock contended, cache clear skipped");
            return Ok(ResetOutcome::Contended);
        };

        let outcome = guard.clear().await;
        guard.release().await?;

        let removed = outcome?;
        info!(%dev_eui, removed, "device cache cleared");
        Ok(if removed {
            ResetOutcome::Cleared
        } else {
            ResetOutcome::Skipped
        })
    }

    async fn arbitrate(
        guard: &DeviceLockGuard<S>,
        gateway_id: &str,
        observed_up: u32,
        observed_down: u32,
    ) -> Result<FCntDownResult, CoordinationError> {
        let dev_eui = guard.dev_eui();
        let cached = guard.read_state().await?;

        match decide_next_fcnt_down(cached.as_ref(), gateway_id, observed_up, observed_down) {
            FCntDownDecision::Issue { state, fcnt_down } => {
                guard.write_state(&state).await?;
                debug!(%dev_eui, gateway_id, observed_up, fcnt_down, "downlink counter issued");
                Ok(FCntDownResult::Issued(fcnt_down))
            }
            FCntDownDecision::NotOwner => {
                debug!(
                    %dev_eui,
                    gateway_id,
                    observed_up,
                    cached_up = cached.as_ref().map(|s| s.fcnt_up),
                    owner = cached.as_ref().map(|s| s.gateway_id.as_str()),
                    "uplink owned by another gateway or stale"
                );
                Ok(FCntDownResult::NotOwner)
            }
            FCntDownDecision::Exhausted { fcnt_down } => CounterExhaustedSnafu { dev_eui, fcnt_down }.fail(),
        }
    }

    async fn reset_if_started(&self, guard: &DeviceLockGuard<S>) -> Result<ResetOutcome, CoordinationError> {
        let cached = guard.read_state().await?;
        if !should_reset_abp_session(cached.as_ref(), self.settings.abp_reset_min_fcnt_up) {
            return Ok(ResetOutcome::Skipped);
        }

        guard.clear().await?;
        debug!(
            dev_eui = %guard.dev_eui(),
            gateway_id = guard.owner(),
            fcnt_up = cached.map(|s| s.fcnt_up),
            "ABP session cache reset"
        );
        Ok(ResetOutcome::Cleared)
    }
}

#[cfg(test)]
mod tests {
    use lora_cache::CacheStoreExt;
    use lora_cache::DeterministicCacheStore;
    use lora_cache::LockWaitConfig;

    use super::*;
    use crate::keys;
    use crate::types::DeviceFrameCounterState;

    const D1: DevEui = DevEui(0xD1);

    fn arbitrator(store: Arc<DeterministicCacheStore>) -> FrameCounterArbitrator<DeterministicCacheStore> {
        FrameCounterArbitrator::new(store, &CoordinationConfig::default())
    }

    async fn cached(store: &DeterministicCacheStore) -> Option<DeviceFrameCounterState> {
        store.object_get(&keys::device_state(D1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_scenario_session_retry_new_uplink_stale() {
        let store = DeterministicCacheStore::new();
        let arb = arbitrator(store.clone());

        assert_eq!(arb.next_fcnt_down(D1, "G1", 1, 1).await.unwrap(), FCntDownResult::Issued(2));
        assert_eq!(arb.next_fcnt_down(D1, "G1", 1, 1).await.unwrap(), FCntDownResult::Issued(3));
        assert_eq!(arb.next_fcnt_down(D1, "G1", 3, 10).await.unwrap(), FCntDownResult::Issued(11));

        let before = cached(&store).await;
        let late = arb.next_fcnt_down(D1, "G1", 1, 1).await.unwrap();
        assert_eq!(late, FCntDownResult::NotOwner);
        assert_eq!(late.wire_value(), Some(0));
        assert_eq!(cached(&store).await, before);
    }

    #[tokio::test]
    async fn test_lock_released_after_each_call() {
        let store = DeterministicCacheStore::new();
        let arb = arbitrator(store.clone());
        arb.next_fcnt_down(D1, "G1", 1, 1).await.unwrap();
        assert!(!store.key_exists(&keys::device_lock(D1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_is_distinct_from_not_owner() {
        let store = Arc::new(DeterministicCacheStore::with_wait_config(LockWaitConfig {
            timeout_ms: 50,
            ..Default::default()
        }));
        let arb = arbitrator(store.clone());
        store
            .lock_take(&keys::device_lock(D1), "someone-else", std::time::Duration::from_secs(10), false)
            .await
            .unwrap();

        let result = arb.next_fcnt_down(D1, "G1", 1, 1).await.unwrap();
        assert_eq!(result, FCntDownResult::Contended);
        assert_eq!(result.wire_value(), None);
        assert!(cached(&store).await.is_none());
    }

    #[tokio::test]
    async fn test_counter_exhausted() {
        let store = DeterministicCacheStore::new();
        let arb = arbitrator(store.clone());
        let err = arb.next_fcnt_down(D1, "G1", 1, u32::MAX).await.unwrap_err();
        assert!(matches!(err, CoordinationError::CounterExhausted { fcnt_down: u32::MAX, .. }));
        // The lock is still released on the error path
        assert!(!store.key_exists(&keys::device_lock(D1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_abp_reset_guard() {
        let store = DeterministicCacheStore::new();
        let arb = arbitrator(store.clone());

        assert_eq!(arb.abp_fcnt_cache_reset(D1, "G1").await.unwrap(), ResetOutcome::Skipped);

        arb.next_fcnt_down(D1, "G1", 1, 0).await.unwrap();
        assert_eq!(arb.abp_fcnt_cache_reset(D1, "G1").await.unwrap(), ResetOutcome::Skipped);
        assert!(cached(&store).await.is_some());

        arb.next_fcnt_down(D1, "G1", 2, 0).await.unwrap();
        assert_eq!(arb.abp_fcnt_cache_reset(D1, "G1").await.unwrap(), ResetOutcome::Cleared);
        assert!(cached(&store).await.is_none());
    }

    #[tokio::test]
    async fn test_admin_clear() {
        let store = DeterministicCacheStore::new();
        let arb = arbitrator(store.clone());
        arb.next_fcnt_down(D1, "G1", 1, 0).await.unwrap();

        assert_eq!(arb.clear_device_cache(D1).await.unwrap(), ResetOutcome::Cleared);
        assert_eq!(arb.clear_device_cache(D1).await.unwrap(), ResetOutcome::Skipped);
        // A fresh session starts over
        assert_eq!(arb.next_fcnt_down(D1, "G2", 1, 0).await.unwrap(), FCntDownResult::Issued(1));
    }
}
