//! Scoped, owner-checked locks over the shared cache.
//!
//! Provides mutual exclusion across gateway processes with:
//! - TTL-based expiry so a crashed holder cannot wedge a resource
//! - Release that verifies ownership and surfaces a rejected release
//! - Best-effort release on drop for early-return and panic paths

use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use snafu::ResultExt;
use tracing::debug;
use tracing::error;

use crate::error::CacheSnafu;
use crate::error::CoordinationError;

/// A named lock on one cache key.
pub struct CacheLock<S: CacheStore + ?Sized> {
    store: Arc<S>,
    key: String,
    owner: String,
    ttl: Duration,
}

impl<S: CacheStore + ?Sized + 'static> CacheLock<S> {
    /// Create a lock handle. Nothing is taken until [`acquire`](Self::acquire).
    pub fn new(store: Arc<S>, key: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            ttl,
        }
    }

    /// Take the lock.
    ///
    /// Returns `None` when the lock is held by someone else (immediately when
    /// `blocking` is false, after the store's wait bound otherwise).
    pub async fn acquire(self, blocking: bool) -> Result<Option<CacheLockGuard<S>>, CoordinationError> {
        let taken = self
            .store
            .lock_take(&self.key, &self.owner, self.ttl, blocking)
            .await
            .context(CacheSnafu { operation: "lock take" })?;

        if !taken {
            debug!(key = %self.key, owner = %self.owner, blocking, "lock contended");
            return Ok(None);
        }

        debug!(key = %self.key, owner = %self.owner, ttl_ms = self.ttl.as_millis() as u64, "lock acquired");
        Ok(Some(CacheLockGuard {
            store: self.store,
            key: self.key,
            owner: self.owner,
            released: false,
        }))
    }
}

/// Proof that a [`CacheLock`] is held.
///
/// Call [`release`](Self::release) to give the lock back and learn whether the
/// release was accepted. Dropping the guard without releasing spawns a
/// best-effort release; the TTL covers the case where that fails too.
pub struct CacheLockGuard<S: CacheStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    owner: String,
    released: bool,
}

impl<S: CacheStore + ?Sized + 'static> CacheLockGuard<S> {
    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The lock owner.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The store the lock lives in.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Release the lock.
    ///
    /// A release the store rejects means the lock expired and may have been
    /// taken over while we believed we held it. That is reported as
    /// [`CoordinationError::LockReleaseRejected`] and must not be ignored.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        let accepted = self
            .store
            .lock_release(&self.key, &self.owner)
            .await
            .context(CacheSnafu { operation: "lock release" })?;

        if !accepted {
            error!(key = %self.key, owner = %self.owner, "lock release rejected: not the current owner");
            return Err(CoordinationError::LockReleaseRejected {
                key: self.key.clone(),
                owner: self.owner.clone(),
            });
        }

        debug!(key = %self.key, owner = %self.owner, "lock released");
        Ok(())
    }
}

impl<S: CacheStore + ?Sized + 'static> Drop for CacheLockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %self.key, "no runtime to release lock on drop (will expire via TTL)");
            return;
        };

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            match store.lock_release(&key, &owner).await {
                Ok(true) => debug!(key = %key, owner = %owner, "lock released on drop"),
                Ok(false) => error!(key = %key, owner = %owner, "lock release on drop rejected: not the current owner"),
                Err(e) => debug!(key = %key, error = %e, "lock release on drop failed (will expire via TTL)"),
            }
        });
    }
}
