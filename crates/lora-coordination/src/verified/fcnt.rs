//! Downlink frame counter arbitration.

use crate::types::DeviceFrameCounterState;

/// What the arbitrator should do with an observed uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FCntDownDecision {
    /// Persist `state` and hand out `fcnt_down`.
    Issue {
        /// State to write back.
        state: DeviceFrameCounterState,
        /// Counter to issue (equals `state.fcnt_down`).
        fcnt_down: u32,
    },
    /// Another gateway owns this exchange, or the uplink is stale. No change.
    NotOwner,
    /// Issuing would wrap the 32-bit counter.
    Exhausted {
        /// The last issued counter.
        fcnt_down: u32,
    },
}

/// Decide the next downlink counter for an uplink observed by `gateway_id`.
///
/// - No cached state: a new session, issue `observed_down + 1`.
/// - `observed_up` above the cached counter: this gateway takes ownership and
///   issues `max(observed_down, cached_down) + 1`.
/// - Same `observed_up` from the owning gateway: a retry, issue
///   `cached_down + 1`. `observed_down` is not consulted; the owner is trusted.
/// - Anything else: [`FCntDownDecision::NotOwner`].
pub fn decide_next_fcnt_down(
    cached: Option<&DeviceFrameCounterState>,
    gateway_id: &str,
    observed_up: u32,
    observed_down: u32,
) -> FCntDownDecision {
    let (fcnt_up, base_down) = match cached {
        None => (observed_up, observed_down),
        Some(state) if observed_up > state.fcnt_up => (observed_up, observed_down.max(state.fcnt_down)),
        Some(state) if observed_up == state.fcnt_up && gateway_id == state.gateway_id => {
            (state.fcnt_up, state.fcnt_down)
        }
        Some(_) => return FCntDownDecision::NotOwner,
    };

    match base_down.checked_add(1) {
        Some(fcnt_down) => FCntDownDecision::Issue {
            state: DeviceFrameCounterState {
                fcnt_up,
                fcnt_down,
                gateway_id: gateway_id.to_string(),
            },
            fcnt_down,
        },
        None => FCntDownDecision::Exhausted { fcnt_down: base_down },
    }
}

/// Whether an ABP counter reset may clear the cached session.
///
/// A session whose cached `fcnt_up` is at or below `min_fcnt_up` is left alone:
/// it was just (re)started, possibly by a concurrent gateway.
#[inline]
pub fn should_reset_abp_session(cached: Option<&DeviceFrameCounterState>, min_fcnt_up: u32) -> bool {
    cached.is_some_and(|state| state.fcnt_up > min_fcnt_up)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(up: u32, down: u32, gw: &str) -> DeviceFrameCounterState {
        DeviceFrameCounterState {
            fcnt_up: up,
            fcnt_down: down,
            gateway_id: gw.to_string(),
        }
    }

    fn issued(decision: FCntDownDecision) -> u32 {
        match decision {
            FCntDownDecision::Issue { fcnt_down, .. } => fcnt_down,
            other => panic!("expected issue, got {other:?}"),
        }
    }

    #[test]
    fn test_session_start() {
        let decision = decide_next_fcnt_down(None, "gw-1", 1, 1);
        assert_eq!(decision, FCntDownDecision::Issue {
            state: state(1, 2, "gw-1"),
            fcnt_down: 2,
        });
    }

    #[test]
    fn test_new_uplink_takes_max_of_counters() {
        assert_eq!(issued(decide_next_fcnt_down(Some(&state(1, 3, "gw-1")), "gw-2", 3, 10)), 11);
        assert_eq!(issued(decide_next_fcnt_down(Some(&state(1, 30, "gw-1")), "gw-2", 3, 10)), 31);
    }

    #[test]
    fn test_retry_by_owner_bumps() {
        assert_eq!(issued(decide_next_fcnt_down(Some(&state(1, 2, "gw-1")), "gw-1", 1, 1)), 3);
    }

    #[test]
    fn test_duplicate_from_other_gateway() {
        let cached = state(5, 7, "gw-1");
        assert_eq!(decide_next_fcnt_down(Some(&cached), "gw-2", 5, 7), FCntDownDecision::NotOwner);
        assert_eq!(decide_next_fcnt_down(Some(&cached), "gw-2", 4, 7), FCntDownDecision::NotOwner);
    }

    #[test]
    fn test_stale_from_owner() {
        let cached = state(5, 7, "gw-1");
        assert_eq!(decide_next_fcnt_down(Some(&cached), "gw-1", 4, 7), FCntDownDecision::NotOwner);
    }

    #[test]
    fn test_exhausted_counter() {
        let cached = state(5, u32::MAX, "gw-1");
        assert_eq!(decide_next_fcnt_down(Some(&cached), "gw-1", 5, 0), FCntDownDecision::Exhausted {
            fcnt_down: u32::MAX
        });
        assert_eq!(decide_next_fcnt_down(None, "gw-1", 0, u32::MAX), FCntDownDecision::Exhausted {
            fcnt_down: u32::MAX
        });
    }

    #[test]
    fn test_abp_reset_threshold() {
        assert!(!should_reset_abp_session(None, 1));
        assert!(!should_reset_abp_session(Some(&state(1, 9, "gw")), 1));
        assert!(should_reset_abp_session(Some(&state(2, 9, "gw")), 1));
    }
}
