use std::time::Duration;

use lora_constants::cache::LOCK_INITIAL_BACKOFF_MS;
use lora_constants::cache::LOCK_MAX_BACKOFF_MS;
use lora_constants::cache::LOCK_WAIT_TIMEOUT_MS;

/// How a blocking `lock_take` waits for a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWaitConfig {
    /// Maximum time to wait before reporting the lock as not taken.
    pub timeout_ms: u64,
    /// Initial backoff between attempts in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff between attempts in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for LockWaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: LOCK_WAIT_TIMEOUT_MS,
            initial_backoff_ms: LOCK_INITIAL_BACKOFF_MS,
            max_backoff_ms: LOCK_MAX_BACKOFF_MS,
        }
    }
}

impl LockWaitConfig {
    /// Wait bound as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
