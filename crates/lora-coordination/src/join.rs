//! Join Coordinator: join eligibility and exactly-once nonce processing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use lora_cache::CacheStoreExt;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CoordinationConfig;
use crate::config::JoinSettings;
use crate::device_lock::DeviceLockSession;
use crate::error::CacheSnafu;
use crate::error::CoordinationError;
use crate::error::RegistrySnafu;
use crate::keys;
use crate::lock::CacheLock;
use crate::registry::DeviceRegistry;
use crate::types::DevEui;
use crate::types::DevNonce;
use crate::types::JoinInfo;
use crate::verified::join::check_join_eligibility;
use crate::verified::join::JoinEligibility;

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    /// The registry has no credential for the device.
    NotInNetwork,
    /// The device is pinned to another gateway.
    WrongGateway {
        /// The pinned gateway.
        owner: String,
    },
}

impl fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinRejection::NotInNetwork => write!(f, "not in network"),
            JoinRejection::WrongGateway { owner } => write!(f, "wrong gateway, owner is {owner}"),
        }
    }
}

/// Outcome of a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    /// The join may proceed with this credential.
    Accepted {
        /// Device primary credential.
        credential: String,
        /// Gateway the device is pinned to, if any.
        desired_gateway: Option<String>,
    },
    /// Terminal business decision for this device.
    Rejected(JoinRejection),
    /// This nonce was already consumed; the device may retry with a new one.
    NonceReplay,
    /// The join-info lock could not be taken. The nonce was given back.
    Contended,
}

enum JoinInfoLoad {
    Loaded(Option<JoinInfo>),
    Contended,
}

/// Validates joins and enforces one-time use of each DevNonce.
pub struct JoinCoordinator<S: CacheStore + ?Sized, R: DeviceRegistry + ?Sized> {
    store: Arc<S>,
    registry: Arc<R>,
    locks: DeviceLockSession<S>,
    settings: JoinSettings,
}

impl<S, R> JoinCoordinator<S, R>
where
    S: CacheStore + ?Sized + 'static,
    R: DeviceRegistry + ?Sized,
{
    /// Create a coordinator.
    pub fn new(store: Arc<S>, registry: Arc<R>, config: &CoordinationConfig) -> Self {
        Self {
            locks: DeviceLockSession::new(store.clone(), config.device.clone()),
            store,
            registry,
            settings: config.join.clone(),
        }
    }

    /// Resolve a join relayed by `gateway_id` carrying `dev_nonce`.
    ///
    /// The nonce is consumed first, atomically, so that of several gateways
    /// relaying the same join frame exactly one gets past this point. If the
    /// request then cannot complete (lock contention, registry failure) the
    /// nonce is given back so a relay of the same frame can still be processed.
    pub async fn resolve_join(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        dev_nonce: DevNonce,
    ) -> Result<JoinDecision, CoordinationError> {
        let nonce_key = keys::dev_nonce(dev_eui, dev_nonce);
        let consumed = self
            .store
            .string_set(&nonce_key, &dev_nonce.to_string(), Some(self.nonce_ttl()), true)
            .await
            .context(CacheSnafu { operation: "mark dev nonce" })?;
        if !consumed {
            debug!(%dev_eui, gateway_id, %dev_nonce, "dev nonce already used");
            return Ok(JoinDecision::NonceReplay);
        }

        let info = match self.load_join_info(dev_eui, gateway_id).await {
            Ok(JoinInfoLoad::Loaded(info)) => info,
            Ok(JoinInfoLoad::Contended) => {
                warn!(%dev_eui, gateway_id, "join info lock contended");
                self.give_back_nonce(&nonce_key).await;
                return Ok(JoinDecision::Contended);
            }
            Err(e) => {
                self.give_back_nonce(&nonce_key).await;
                return Err(e);
            }
        };

        match check_join_eligibility(info.as_ref(), gateway_id) {
            JoinEligibility::NotInNetwork => {
                info!(%dev_eui, gateway_id, "join rejected: not in network");
                return Ok(JoinDecision::Rejected(JoinRejection::NotInNetwork));
            }
            JoinEligibility::WrongGateway { owner } => {
                info!(%dev_eui, gateway_id, owner = %owner, "join rejected: wrong gateway");
                return Ok(JoinDecision::Rejected(JoinRejection::WrongGateway { owner }));
            }
            JoinEligibility::Eligible => {}
        }

        self.restart_session(dev_eui, gateway_id).await;

        let Some(info) = info else {
            return Ok(JoinDecision::Rejected(JoinRejection::NotInNetwork));
        };
        debug!(%dev_eui, gateway_id, %dev_nonce, "join accepted");
        Ok(JoinDecision::Accepted {
            credential: info.primary_credential,
            desired_gateway: info.desired_gateway,
        })
    }

    /// Read cached join info, populating it from the registry under the
    /// join-info lock when absent.
    async fn load_join_info(&self, dev_eui: DevEui, gateway_id: &str) -> Result<JoinInfoLoad, CoordinationError> {
        let key = keys::join_info(dev_eui);
        let lock = CacheLock::new(
            self.store.clone(),
            keys::join_info_lock(dev_eui),
            gateway_id,
            Duration::from_secs(self.settings.info_lock_ttl_secs),
        );
        let Some(guard) = lock.acquire(true).await? else {
            return Ok(JoinInfoLoad::Contended);
        };

        let loaded = self.read_or_fetch_join_info(dev_eui, &key).await;
        guard.release().await?;
        loaded.map(JoinInfoLoad::Loaded)
    }

    async fn read_or_fetch_join_info(&self, dev_eui: DevEui, key: &str) -> Result<Option<JoinInfo>, CoordinationError> {
        let cached: Option<JoinInfo> = self
            .store
            .object_get(key)
            .await
            .context(CacheSnafu { operation: "read join info" })?;
        if cached.is_some() {
            return Ok(cached);
        }

        let credential = self.registry.get_primary_credential(dev_eui).await.context(RegistrySnafu {
            dev_eui,
            operation: "get primary credential",
        })?;
        let Some(primary_credential) = credential else {
            // Unknown devices are not cached; a device added later joins on its next attempt
            return Ok(None);
        };

        let twin = self.registry.get_twin_metadata(dev_eui).await.context(RegistrySnafu {
            dev_eui,
            operation: "get twin metadata",
        })?;
        let info = JoinInfo {
            primary_credential,
            desired_gateway: twin.and_then(|t| t.gateway_affinity).filter(|g| !g.is_empty()),
        };

        self.store
            .object_set(key, &info, Some(Duration::from_secs(self.settings.info_ttl_secs)), false)
            .await
            .context(CacheSnafu { operation: "write join info" })?;
        debug!(%dev_eui, pinned = info.desired_gateway.is_some(), "join info cached");
        Ok(Some(info))
    }

    /// Clear the device's frame-counter state so the new session starts
    /// fresh. Best effort: no failure here fails the join.
    async fn restart_session(&self, dev_eui: DevEui, gateway_id: &str) {
        let guard = match self.locks.acquire(dev_eui, gateway_id, true).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!(%dev_eui, gateway_id, "failed to acquire device lock to reset session after join");
                return;
            }
            Err(e) => {
                warn!(%dev_eui, gateway_id, error = %e, "device lock unavailable, session not reset after join");
                return;
            }
        };

        let cleared = guard.clear().await;
        if let Err(e) = guard.release().await {
            warn!(%dev_eui, gateway_id, error = %e, "device lock release failed after join reset");
        }
        match cleared {
            Ok(true) => debug!(%dev_eui, gateway_id, "session state cleared after join"),
            Ok(false) => {}
            Err(e) => warn!(%dev_eui, gateway_id, error = %e, "failed to clear session state after join"),
        }
    }

    async fn give_back_nonce(&self, nonce_key: &str) {
        if let Err(e) = self.store.key_delete(nonce_key).await {
            warn!(key = nonce_key, error = %e, "failed to release dev nonce marker");
        }
    }

    fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.nonce_ttl_secs)
    }
}
