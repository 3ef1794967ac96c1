//! Uplink duplicate detection.

use crate::types::DeviceFrameCounterState;

/// Outcome of checking one uplink against the cached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// First uplink seen for the device: create the session, owned by us.
    Initialize,
    /// A newer uplink: take ownership of the session.
    ClaimOwnership(DeviceFrameCounterState),
    /// The owning gateway repeating the current uplink.
    OwnerRepeat,
    /// Another gateway already handled this uplink.
    Duplicate {
        /// Gateway owning the session.
        owner: String,
    },
}

/// Decide whether `fcnt_up` reported by `gateway_id` is a duplicate.
pub fn decide_duplicate(cached: Option<&DeviceFrameCounterState>, gateway_id: &str, fcnt_up: u32) -> DedupDecision {
    match cached {
        None => DedupDecision::Initialize,
        Some(state) if state.fcnt_up < fcnt_up => DedupDecision::ClaimOwnership(DeviceFrameCounterState {
            fcnt_up,
            fcnt_down: state.fcnt_down,
            gateway_id: gateway_id.to_string(),
        }),
        Some(state) if state.fcnt_up == fcnt_up && state.gateway_id == gateway_id => DedupDecision::OwnerRepeat,
        Some(state) => DedupDecision::Duplicate {
            owner: state.gateway_id.clone(),
        },
    }
}
