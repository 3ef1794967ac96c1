//! Preferred gateway election.

use crate::types::GatewayCandidate;

/// Elect the candidate with the strongest signal. Ties go to the earliest
/// registered candidate. A non-finite RSSI only wins when no candidate has a
/// finite one.
pub fn elect_preferred(candidates: &[GatewayCandidate]) -> Option<&GatewayCandidate> {
    candidates.iter().fold(None, |best: Option<&GatewayCandidate>, candidate| match best {
        Some(current) if !outranks(candidate.rssi, current.rssi) => Some(current),
        _ => Some(candidate),
    })
}

#[inline]
fn outranks(rssi: f64, current: f64) -> bool {
    match (rssi.is_finite(), current.is_finite()) {
        (true, true) => rssi > current,
        (true, false) => true,
        (false, _) => false,
    }
}

/// Register a candidate. A gateway already present keeps its first report.
///
/// Returns whether the list changed.
pub fn add_candidate(candidates: &mut Vec<GatewayCandidate>, candidate: GatewayCandidate) -> bool {
    if candidates.iter().any(|c| c.gateway_id == candidate.gateway_id) {
        return false;
    }
    candidates.push(candidate);
    true
}

/// Whether an elected record for `record_fcnt_up` already answers a request
/// for `requested_fcnt_up`.
#[inline]
pub fn record_covers(record_fcnt_up: u32, requested_fcnt_up: u32) -> bool {
    record_fcnt_up >= requested_fcnt_up
}
