//! Device Lock Session: exclusive, gateway-owned access to one device's state.
//!
//! The cached [`DeviceFrameCounterState`] can only be reached through a
//! [`DeviceLockGuard`], and a guard only exists while the device lock is held.
//! State access without the lock does not compile.

use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use lora_cache::CacheStoreExt;
use snafu::ResultExt;

use crate::config::DeviceLockSettings;
use crate::error::CacheSnafu;
use crate::error::CoordinationError;
use crate::keys;
use crate::lock::CacheLock;
use crate::lock::CacheLockGuard;
use crate::types::DevEui;
use crate::types::DeviceFrameCounterState;

/// Factory for device lock sessions.
pub struct DeviceLockSession<S: CacheStore + ?Sized> {
    store: Arc<S>,
    settings: DeviceLockSettings,
}

impl<S: CacheStore + ?Sized + 'static> DeviceLockSession<S> {
    /// Create a session factory over `store`.
    pub fn new(store: Arc<S>, settings: DeviceLockSettings) -> Self {
        Self { store, settings }
    }

    /// Take the lock for `dev_eui` on behalf of `owner` with the configured TTL.
    pub async fn acquire(
        &self,
        dev_eui: DevEui,
        owner: &str,
        blocking: bool,
    ) -> Result<Option<DeviceLockGuard<S>>, CoordinationError> {
        self.acquire_with_ttl(dev_eui, owner, self.settings.lock_ttl(), blocking).await
    }

    /// Take the lock for `dev_eui` with an explicit TTL.
    pub async fn acquire_with_ttl(
        &self,
        dev_eui: DevEui,
        owner: &str,
        ttl: Duration,
        blocking: bool,
    ) -> Result<Option<DeviceLockGuard<S>>, CoordinationError> {
        let lock = CacheLock::new(self.store.clone(), keys::device_lock(dev_eui), owner, ttl);
        Ok(lock.acquire(blocking).await?.map(|lock| DeviceLockGuard {
            lock,
            dev_eui,
            state_ttl: self.settings.state_ttl(),
        }))
    }
}

/// A held device lock with access to the device's cached state.
pub struct DeviceLockGuard<S: CacheStore + ?Sized + 'static> {
    lock: CacheLockGuard<S>,
    dev_eui: DevEui,
    state_ttl: Duration,
}

impl<S: CacheStore + ?Sized + 'static> DeviceLockGuard<S> {
    /// Device this guard is for.
    pub fn dev_eui(&self) -> DevEui {
        self.dev_eui
    }

    /// Owner holding the lock.
    pub fn owner(&self) -> &str {
        self.lock.owner()
    }

    /// Read the cached state.
    pub async fn read_state(&self) -> Result<Option<DeviceFrameCounterState>, CoordinationError> {
        self.lock
            .store()
            .object_get(&keys::device_state(self.dev_eui))
            .await
            .context(CacheSnafu { operation: "read device state" })
    }

    /// Overwrite the cached state.
    pub async fn write_state(&self, state: &DeviceFrameCounterState) -> Result<(), CoordinationError> {
        self.lock
            .store()
            .object_set(&keys::device_state(self.dev_eui), state, Some(self.state_ttl), false)
            .await
            .context(CacheSnafu { operation: "write device state" })?;
        Ok(())
    }

    /// Create the state for a device seen for the first time.
    pub async fn initialize_state(
        &self,
        fcnt_up: u32,
        fcnt_down: u32,
    ) -> Result<DeviceFrameCounterState, CoordinationError> {
        let state = DeviceFrameCounterState {
            fcnt_up,
            fcnt_down,
            gateway_id: self.owner().to_string(),
        };
        self.write_state(&state).await?;
        Ok(state)
    }

    /// Evict the cached state. Returns whether anything was removed.
    pub async fn clear(&self) -> Result<bool, CoordinationError> {
        self.lock
            .store()
            .key_delete(&keys::device_state(self.dev_eui))
            .await
            .context(CacheSnafu { operation: "clear device state" })
    }

    /// Release the device lock. See [`CacheLockGuard::release`].
    pub async fn release(self) -> Result<(), CoordinationError> {
        self.lock.release().await
    }
}

#[cfg(test)]
mod tests {
    use lora_cache::DeterministicCacheStore;

    use super::*;

    fn session(store: Arc<DeterministicCacheStore>) -> DeviceLockSession<DeterministicCacheStore> {
        DeviceLockSession::new(store, DeviceLockSettings::default())
    }

    #[tokio::test]
    async fn test_state_round_trip_under_lock() {
        let store = DeterministicCacheStore::new();
        let guard = session(store.clone()).acquire(DevEui(1), "gw-1", true).await.unwrap().unwrap();

        assert!(guard.read_state().await.unwrap().is_none());
        let state = guard.initialize_state(4, 9).await.unwrap();
        assert_eq!(state.gateway_id, "gw-1");
        assert_eq!(guard.read_state().await.unwrap(), Some(state));

        assert!(guard.clear().await.unwrap());
        assert!(guard.read_state().await.unwrap().is_none());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_session_is_contended() {
        let store = DeterministicCacheStore::new();
        let sessions = session(store);
        let held = sessions.acquire(DevEui(1), "gw-1", false).await.unwrap().unwrap();

        assert!(sessions.acquire(DevEui(1), "gw-2", false).await.unwrap().is_none());
        // Other devices are independent
        let other = sessions.acquire(DevEui(2), "gw-2", false).await.unwrap().unwrap();

        held.release().await.unwrap();
        other.release().await.unwrap();
        assert!(sessions.acquire(DevEui(1), "gw-2", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_uses_message_lock_key() {
        let store = DeterministicCacheStore::new();
        let _guard = session(store.clone()).acquire(DevEui(0xAB), "gw-1", false).await.unwrap().unwrap();
        assert_eq!(store.string_get("00000000000000ABmsglock").await.unwrap().as_deref(), Some("gw-1"));
    }
}
