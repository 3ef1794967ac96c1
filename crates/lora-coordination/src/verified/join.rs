//! Join eligibility.

use crate::types::JoinInfo;

/// Whether a join request may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinEligibility {
    /// Credential found and gateway affinity satisfied.
    Eligible,
    /// The registry has no credential for the device.
    NotInNetwork,
    /// The device is pinned to a different gateway.
    WrongGateway {
        /// The pinned gateway.
        owner: String,
    },
}

/// Check cached join info against the gateway relaying the join.
///
/// Gateway ids compare case-insensitively.
pub fn check_join_eligibility(info: Option<&JoinInfo>, requesting_gateway: &str) -> JoinEligibility {
    let Some(info) = info else {
        return JoinEligibility::NotInNetwork;
    };

    match info.desired_gateway.as_deref() {
        Some(owner) if !owner.is_empty() && !owner.eq_ignore_ascii_case(requesting_gateway) => {
            JoinEligibility::WrongGateway {
                owner: owner.to_string(),
            }
        }
        _ => JoinEligibility::Eligible,
    }
}
