//! Pure functions for lock waiting.
//!
//! Deterministic and side-effect free: randomness and time are passed in.

/// Result of backoff calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// Sleep duration in milliseconds (includes jitter).
    pub sleep_ms: u64,
    /// Backoff value for the next iteration.
    pub next_backoff_ms: u64,
}

/// Compute exponential backoff with additive jitter.
///
/// `jitter_seed` is reduced modulo `current_backoff_ms / 2 + 1`, so any random
/// `u64` may be passed. The next backoff doubles, capped at `max_backoff_ms`.
#[inline]
pub fn compute_backoff_with_jitter(current_backoff_ms: u64, max_backoff_ms: u64, jitter_seed: u64) -> BackoffResult {
    let max_jitter = current_backoff_ms.saturating_div(2).saturating_add(1);
    let jitter = jitter_seed % max_jitter;

    BackoffResult {
        sleep_ms: current_backoff_ms.saturating_add(jitter),
        next_backoff_ms: current_backoff_ms.saturating_mul(2).min(max_backoff_ms),
    }
}

/// Clamp a sleep so a waiter never oversleeps its deadline.
///
/// Returns 0 once `elapsed_ms` has reached `timeout_ms`.
#[inline]
pub fn clamp_sleep_to_deadline(sleep_ms: u64, elapsed_ms: u64, timeout_ms: u64) -> u64 {
    sleep_ms.min(timeout_ms.saturating_sub(elapsed_ms))
}
