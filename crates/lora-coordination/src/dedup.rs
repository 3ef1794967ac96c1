//! Cross-gateway uplink deduplication.

use std::sync::Arc;

use lora_cache::CacheStore;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::config::CoordinationConfig;
use crate::device_lock::DeviceLockGuard;
use crate::device_lock::DeviceLockSession;
use crate::error::CoordinationError;
use crate::types::DevEui;
use crate::verified::dedup::decide_duplicate;
use crate::verified::dedup::DedupDecision;

/// Whether an uplink was already handled by another gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    /// The uplink was already claimed by another gateway.
    pub is_duplicate: bool,
    /// Gateway owning the session after the check.
    pub gateway_id: String,
}

/// Outcome of a deduplication check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// The check ran under the device lock.
    Decided(DeduplicationResult),
    /// The device lock could not be taken.
    Contended,
}

/// Claims uplinks for gateways under the device lock.
pub struct Deduplicator<S: CacheStore + ?Sized> {
    locks: DeviceLockSession<S>,
}

impl<S: CacheStore + ?Sized + 'static> Deduplicator<S> {
    /// Create a deduplicator over `store`.
    pub fn new(store: Arc<S>, config: &CoordinationConfig) -> Self {
        Self {
            locks: DeviceLockSession::new(store, config.device.clone()),
        }
    }

    /// Check `fcnt_up` reported by `gateway_id`, claiming the session when
    /// the uplink is new.
    pub async fn check(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        fcnt_up: u32,
        fcnt_down: u32,
    ) -> Result<DedupOutcome, CoordinationError> {
        let Some(guard) = self.locks.acquire(dev_eui, gateway_id, true).await? else {
            return Ok(DedupOutcome::Contended);
        };

        let outcome = Self::decide(&guard, fcnt_up, fcnt_down).await;
        guard.release().await?;
        outcome.map(DedupOutcome::Decided)
    }

    async fn decide(
        guard: &DeviceLockGuard<S>,
        fcnt_up: u32,
        fcnt_down: u32,
    ) -> Result<DeduplicationResult, CoordinationError> {
        let gateway_id = guard.owner().to_string();
        let cached = guard.read_state().await?;

        let result = match decide_duplicate(cached.as_ref(), &gateway_id, fcnt_up) {
            DedupDecision::Initialize => {
                guard.initialize_state(fcnt_up, fcnt_down).await?;
                DeduplicationResult {
                    is_duplicate: false,
                    gateway_id,
                }
            }
            DedupDecision::ClaimOwnership(state) => {
                guard.write_state(&state).await?;
                DeduplicationResult {
                    is_duplicate: false,
                    gateway_id,
                }
            }
            DedupDecision::OwnerRepeat => DeduplicationResult {
                is_duplicate: false,
                gateway_id,
            },
            DedupDecision::Duplicate { owner } => DeduplicationResult {
                is_duplicate: true,
                gateway_id: owner,
            },
        };

        debug!(
            dev_eui = %guard.dev_eui(),
            fcnt_up,
            is_duplicate = result.is_duplicate,
            owner = %result.gateway_id,
            "deduplication checked"
        );
        Ok(result)
    }
}
