//! The `CacheStore` trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheStoreError;

/// Key/value store with TTLs shared by every gateway process.
///
/// Implementations must make `string_set` with `only_if_not_exists` an atomic
/// set-if-absent, and must make `lock_release` verify the owner. Locks are
/// ordinary keys whose value is the owner id: deleting a lock key frees it, and
/// `lock_take` is not re-entrant (the same owner taking a held lock fails).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a string value. Expired keys read as absent.
    async fn string_get(&self, key: &str) -> Result<Option<String>, CacheStoreError>;

    /// Write a string value.
    ///
    /// Returns `false` without writing when `only_if_not_exists` is set and the
    /// key already holds a live value.
    async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_not_exists: bool,
    ) -> Result<bool, CacheStoreError>;

    /// Whether the key currently holds a live value.
    async fn key_exists(&self, key: &str) -> Result<bool, CacheStoreError>;

    /// Delete a key. Returns whether a live value was removed.
    async fn key_delete(&self, key: &str) -> Result<bool, CacheStoreError>;

    /// List live keys starting with `prefix`, in lexicographic order.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, CacheStoreError>;

    /// Take the lock `key` for `owner` with expiry `ttl`.
    ///
    /// With `blocking` the call waits up to the store's wait bound; without it
    /// the call returns `false` immediately when the lock is held.
    async fn lock_take(&self, key: &str, owner: &str, ttl: Duration, blocking: bool) -> Result<bool, CacheStoreError>;

    /// Release the lock `key` if `owner` still holds it.
    ///
    /// Returns `false` when the lock expired or belongs to someone else.
    async fn lock_release(&self, key: &str, owner: &str) -> Result<bool, CacheStoreError>;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    async fn string_get(&self, key: &str) -> Result<Option<String>, CacheStoreError> {
        (**self).string_get(key).await
    }

    async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_not_exists: bool,
    ) -> Result<bool, CacheStoreError> {
        (**self).string_set(key, value, ttl, only_if_not_exists).await
    }

    async fn key_exists(&self, key: &str) -> Result<bool, CacheStoreError> {
        (**self).key_exists(key).await
    }

    async fn key_delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        (**self).key_delete(key).await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, CacheStoreError> {
        (**self).scan_keys(prefix).await
    }

    async fn lock_take(&self, key: &str, owner: &str, ttl: Duration, blocking: bool) -> Result<bool, CacheStoreError> {
        (**self).lock_take(key, owner, ttl, blocking).await
    }

    async fn lock_release(&self, key: &str, owner: &str) -> Result<bool, CacheStoreError> {
        (**self).lock_release(key, owner).await
    }
}
