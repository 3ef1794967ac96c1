//! In-memory cache store with TTLs on the tokio clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lora_constants::cache::MAX_SCAN_KEYS;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::config::LockWaitConfig;
use crate::error::CacheStoreError;
use crate::store::CacheStore;
use crate::verified::clamp_sleep_to_deadline;
use crate::verified::compute_backoff_with_jitter;

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// A deterministic in-memory cache store.
///
/// Thread-safe; expiry is evaluated lazily against `tokio::time::Instant`, so
/// tests running with a paused clock control expiry with `tokio::time::advance`.
pub struct DeterministicCacheStore {
    data: RwLock<BTreeMap<String, CacheEntry>>,
    wait: LockWaitConfig,
    scan_limit: usize,
}

impl Default for DeterministicCacheStore {
    fn default() -> Self {
        Self::with_wait_config(LockWaitConfig::default())
    }
}

impl DeterministicCacheStore {
    /// Create a new store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store whose blocking lock takes use `wait`.
    pub fn with_wait_config(wait: LockWaitConfig) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            wait,
            scan_limit: MAX_SCAN_KEYS,
        }
    }

    /// Cap the number of keys one `scan_keys` call returns.
    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        self.scan_limit = limit;
        self
    }

    /// All live keys and values, for assertions in tests.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        let now = Instant::now();
        let data = self.data.read().await;
        data.iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Whether the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_key(key: &str) -> Result<(), CacheStoreError> {
        if key.is_empty() {
            return Err(CacheStoreError::InvalidKey {
                key: key.to_string(),
                reason: "key must not be empty".to_string(),
            });
        }
        Ok(())
    }

    async fn set_inner(&self, key: &str, value: &str, ttl: Option<Duration>, only_if_not_exists: bool) -> bool {
        let now = Instant::now();
        let mut data = self.data.write().await;

        if only_if_not_exists && data.get(key).is_some_and(|entry| entry.is_live(now)) {
            return false;
        }

        data.insert(key.to_string(), CacheEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| now + ttl),
        });
        true
    }
}

#[async_trait]
impl CacheStore for DeterministicCacheStore {
    async fn string_get(&self, key: &str) -> Result<Option<String>, CacheStoreError> {
        Self::check_key(key)?;
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone()))
    }

    async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_not_exists: bool,
    ) -> Result<bool, CacheStoreError> {
        Self::check_key(key)?;
        Ok(self.set_inner(key, value, ttl, only_if_not_exists).await)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.string_get(key).await?.is_some())
    }

    async fn key_delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        Self::check_key(key)?;
        let now = Instant::now();
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, CacheStoreError> {
        let now = Instant::now();
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .take(self.scan_limit.saturating_add(1))
            .collect();
        if keys.len() > self.scan_limit {
            keys.truncate(self.scan_limit);
            warn!(prefix, limit = self.scan_limit, "key scan truncated at limit");
        }
        Ok(keys)
    }

    async fn lock_take(&self, key: &str, owner: &str, ttl: Duration, blocking: bool) -> Result<bool, CacheStoreError> {
        Self::check_key(key)?;
        let started = Instant::now();
        let mut backoff_ms = self.wait.initial_backoff_ms;

        loop {
            if self.set_inner(key, owner, Some(ttl), true).await {
                debug!(key, owner, ttl_ms = ttl.as_millis() as u64, "lock taken");
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            // Create rng here to avoid holding non-Send type across await
            let jitter_seed = rand::rng().random::<u64>();
            let backoff = compute_backoff_with_jitter(backoff_ms, self.wait.max_backoff_ms, jitter_seed);
            let sleep_ms = clamp_sleep_to_deadline(backoff.sleep_ms, elapsed_ms, self.wait.timeout_ms);
            if sleep_ms == 0 {
                debug!(key, owner, elapsed_ms, "lock wait timed out");
                return Ok(false);
            }

            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            backoff_ms = backoff.next_backoff_ms;
        }
    }

    async fn lock_release(&self, key: &str, owner: &str) -> Result<bool, CacheStoreError> {
        Self::check_key(key)?;
        let now = Instant::now();
        let mut data = self.data.write().await;

        match data.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == owner => {
                data.remove(key);
                debug!(key, owner, "lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
