//! Preferred gateway election for downlinks to class C devices.
//!
//! Every gateway that hears an uplink registers itself as a candidate for that
//! frame counter, waits for the receive window so the others can do the same,
//! then one of them elects the strongest receiver and records it as
//! `"{gateway_id};{fcnt_up};{update_time_secs}"` under
//! `preferredGateway:{DevEUI}`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use lora_cache::CacheStoreExt;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::config::PreferredGatewaySettings;
use crate::error::CacheSnafu;
use crate::error::CoordinationError;
use crate::keys;
use crate::lock::CacheLock;
use crate::types::now_unix_ms;
use crate::types::DevEui;
use crate::types::GatewayCandidate;
use crate::types::PreferredGatewayCandidates;
use crate::verified::gateway::add_candidate;
use crate::verified::gateway::elect_preferred;
use crate::verified::gateway::record_covers;

/// The elected gateway for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredGatewayRecord {
    /// Elected gateway.
    pub gateway_id: String,
    /// Uplink counter the election was for.
    pub fcnt_up: u32,
    /// Election time (Unix seconds).
    pub update_time_secs: i64,
}

impl PreferredGatewayRecord {
    /// Cache representation.
    pub fn to_cache_string(&self) -> String {
        format!("{};{};{}", self.gateway_id, self.fcnt_up, self.update_time_secs)
    }
}

impl FromStr for PreferredGatewayRecord {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let (Some(gateway_id), Some(fcnt_up), Some(update_time), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(());
        };
        if gateway_id.is_empty() {
            return Err(());
        }
        Ok(Self {
            gateway_id: gateway_id.to_string(),
            fcnt_up: fcnt_up.parse().map_err(|_| ())?,
            update_time_secs: update_time.parse().map_err(|_| ())?,
        })
    }
}

/// Answer to a preferred gateway request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredGatewayResult {
    /// Uplink counter the caller asked about.
    pub request_fcnt_up: u32,
    /// Uplink counter of the stored election.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_fcnt_up: Option<u32>,
    /// Elected gateway.
    pub preferred_gateway_id: Option<String>,
    /// The stored election is for a newer uplink than the one asked about.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
    /// Why no gateway could be elected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PreferredGatewayResult {
    fn from_record(request_fcnt_up: u32, record: &PreferredGatewayRecord) -> Self {
        Self {
            request_fcnt_up,
            current_fcnt_up: Some(record.fcnt_up),
            preferred_gateway_id: Some(record.gateway_id.clone()),
            conflict: record.fcnt_up != request_fcnt_up,
            error_message: None,
        }
    }

    fn failed(request_fcnt_up: u32, message: impl Into<String>) -> Self {
        Self {
            request_fcnt_up,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// An election answered this request without conflict.
    pub fn is_successful(&self) -> bool {
        !self.conflict && self.error_message.is_none()
    }
}

/// Runs preferred gateway elections.
pub struct PreferredGatewayResolver<S: CacheStore + ?Sized> {
    store: Arc<S>,
    settings: PreferredGatewaySettings,
}

impl<S: CacheStore + ?Sized + 'static> PreferredGatewayResolver<S> {
    /// Create a resolver over `store`.
    pub fn new(store: Arc<S>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            settings: config.preferred_gateway.clone(),
        }
    }

    /// Resolve the preferred gateway for uplink `fcnt_up` heard by
    /// `gateway_id` with signal strength `rssi`.
    ///
    /// Failures to elect are reported in the result, not as errors; only
    /// cache failures and lock ownership violations are errors.
    pub async fn resolve(
        &self,
        dev_eui: DevEui,
        gateway_id: &str,
        fcnt_up: u32,
        rssi: f64,
    ) -> Result<PreferredGatewayResult, CoordinationError> {
        if let Some(result) = self.covered(dev_eui, fcnt_up).await? {
            return Ok(result);
        }
        if !rssi.is_finite() {
            warn!(%dev_eui, gateway_id, rssi, "ignoring candidate with non-finite rssi");
            return Ok(PreferredGatewayResult::failed(fcnt_up, format!("invalid rssi {rssi}")));
        }

        let candidate = GatewayCandidate {
            gateway_id: gateway_id.to_string(),
            rssi,
        };
        if !self.register_candidate(dev_eui, fcnt_up, candidate).await? {
            return Ok(PreferredGatewayResult::failed(fcnt_up, "failed to register candidate gateway"));
        }

        tokio::time::sleep(Duration::from_millis(self.settings.receive_window_ms)).await;

        let computation = Uuid::new_v4().to_string();
        for attempt in 1..=self.settings.max_resolution_attempts {
            let lock = CacheLock::new(
                self.store.clone(),
                keys::preferred_gateway_lock(dev_eui),
                computation.as_str(),
                self.lock_ttl(),
            );
            let Some(guard) = lock.acquire(true).await? else {
                debug!(%dev_eui, fcnt_up, attempt, "preferred gateway lock contended");
                if let Some(result) = self.covered(dev_eui, fcnt_up).await? {
                    return Ok(result);
                }
                continue;
            };

            let elected = self.elect_and_store(dev_eui, fcnt_up).await;
            guard.release().await?;
            return elected;
        }

        warn!(%dev_eui, fcnt_up, "preferred gateway resolution gave up");
        Ok(PreferredGatewayResult::failed(
            fcnt_up,
            format!("could not resolve preferred gateway for fcnt {fcnt_up}"),
        ))
    }

    /// The stored election, when it already covers `fcnt_up`.
    async fn covered(&self, dev_eui: DevEui, fcnt_up: u32) -> Result<Option<PreferredGatewayResult>, CoordinationError> {
        Ok(self
            .load(dev_eui)
            .await?
            .filter(|record| record_covers(record.fcnt_up, fcnt_up))
            .map(|record| PreferredGatewayResult::from_record(fcnt_up, &record)))
    }

    async fn register_candidate(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        candidate: GatewayCandidate,
    ) -> Result<bool, CoordinationError> {
        let lock = CacheLock::new(
            self.store.clone(),
            keys::preferred_gateway_candidates_lock(dev_eui, fcnt_up),
            Uuid::new_v4().to_string(),
            self.lock_ttl(),
        );
        let Some(guard) = lock.acquire(true).await? else {
            warn!(%dev_eui, fcnt_up, "candidate list lock contended");
            return Ok(false);
        };

        let stored = self.append_candidate(dev_eui, fcnt_up, candidate).await;
        guard.release().await?;
        stored.map(|()| true)
    }

    async fn append_candidate(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        candidate: GatewayCandidate,
    ) -> Result<(), CoordinationError> {
        let key = keys::preferred_gateway_candidates(dev_eui, fcnt_up);
        let mut candidates: PreferredGatewayCandidates = self
            .store
            .object_get(&key)
            .await
            .context(CacheSnafu { operation: "read gateway candidates" })?
            .unwrap_or_default();

        let gateway_id = candidate.gateway_id.clone();
        if add_candidate(&mut candidates.entries, candidate) {
            self.store
                .object_set(&key, &candidates, Some(Duration::from_secs(self.settings.candidate_ttl_secs)), false)
                .await
                .context(CacheSnafu { operation: "write gateway candidates" })?;
            debug!(%dev_eui, fcnt_up, gateway_id, count = candidates.entries.len(), "gateway candidate registered");
        }
        Ok(())
    }

    async fn elect_and_store(&self, dev_eui: DevEui, fcnt_up: u32) -> Result<PreferredGatewayResult, CoordinationError> {
        if let Some(result) = self.covered(dev_eui, fcnt_up).await? {
            return Ok(result);
        }

        let candidates: Option<PreferredGatewayCandidates> = self
            .store
            .object_get(&keys::preferred_gateway_candidates(dev_eui, fcnt_up))
            .await
            .context(CacheSnafu { operation: "read gateway candidates" })?;
        let Some(winner) = candidates.as_ref().and_then(|c| elect_preferred(&c.entries)) else {
            warn!(%dev_eui, fcnt_up, "no gateway candidates to elect from");
            return Ok(PreferredGatewayResult::failed(fcnt_up, "no gateway candidates found"));
        };

        let record = PreferredGatewayRecord {
            gateway_id: winner.gateway_id.clone(),
            fcnt_up,
            update_time_secs: (now_unix_ms() / 1000) as i64,
        };
        self.store
            .string_set(
                &keys::preferred_gateway(dev_eui),
                &record.to_cache_string(),
                Some(Duration::from_secs(self.settings.record_ttl_secs)),
                false,
            )
            .await
            .context(CacheSnafu { operation: "write preferred gateway" })?;
        debug!(%dev_eui, fcnt_up, gateway_id = %record.gateway_id, rssi = winner.rssi, "preferred gateway elected");
        Ok(PreferredGatewayResult::from_record(fcnt_up, &record))
    }

    /// Stored election, ignoring unreadable values.
    pub async fn load(&self, dev_eui: DevEui) -> Result<Option<PreferredGatewayRecord>, CoordinationError> {
        let raw = self
            .store
            .string_get(&keys::preferred_gateway(dev_eui))
            .await
            .context(CacheSnafu { operation: "read preferred gateway" })?;
        Ok(raw.and_then(|value| match value.parse() {
            Ok(record) => Some(record),
            Err(()) => {
                warn!(%dev_eui, value = %value, "unreadable preferred gateway record");
                None
            }
        }))
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.settings.lock_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use lora_cache::DeterministicCacheStore;

    use super::*;

    const DEV: DevEui = DevEui(0xC1A55C);

    fn resolver(store: &Arc<DeterministicCacheStore>) -> Arc<PreferredGatewayResolver<DeterministicCacheStore>> {
        Arc::new(PreferredGatewayResolver::new(store.clone(), &CoordinationConfig::default()))
    }

    #[test]
    fn test_record_string_format() {
        let record: PreferredGatewayRecord = "gw-1;42;1700000000".parse().unwrap();
        assert_eq!(record.gateway_id, "gw-1");
        assert_eq!(record.fcnt_up, 42);
        assert_eq!(record.to_cache_string(), "gw-1;42;1700000000");

        assert!("gw-1;42".parse::<PreferredGatewayRecord>().is_err());
        assert!("gw-1;x;1".parse::<PreferredGatewayRecord>().is_err());
        assert!("a;1;2;3".parse::<PreferredGatewayRecord>().is_err());
    }

    #[test]
    fn test_result_json_omits_defaults() {
        let result = PreferredGatewayResult {
            request_fcnt_up: 3,
            current_fcnt_up: Some(3),
            preferred_gateway_id: Some("gw".to_string()),
            conflict: false,
            error_message: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("conflict").is_none());
        assert!(json.get("error_message").is_none());
        assert!(result.is_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_strongest_gateway_elected() {
        let store = DeterministicCacheStore::new();
        let resolver = resolver(&store);

        let mut tasks = Vec::new();
        for (gateway, rssi) in [("gw-weak", -110.0), ("gw-strong", -60.0), ("gw-mid", -80.0)] {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move { resolver.resolve(DEV, gateway, 10, rssi).await }));
        }
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.preferred_gateway_id.as_deref(), Some("gw-strong"));
            assert!(result.is_successful());
        }

        let record = resolver.load(DEV).await.unwrap().unwrap();
        assert_eq!(record.gateway_id, "gw-strong");
        assert_eq!(record.fcnt_up, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nan_rssi_is_not_a_candidate() {
        let store = DeterministicCacheStore::new();
        let resolver = resolver(&store);

        let nan = resolver.resolve(DEV, "gw-broken", 11, f64::NAN).await.unwrap();
        assert!(!nan.is_successful());
        assert!(!store.key_exists(&keys::preferred_gateway_candidates(DEV, 11)).await.unwrap());

        let result = resolver.resolve(DEV, "gw-ok", 11, -90.0).await.unwrap();
        assert_eq!(result.preferred_gateway_id.as_deref(), Some("gw-ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_request_reports_conflict() {
        let store = DeterministicCacheStore::new();
        let resolver = resolver(&store);
        resolver.resolve(DEV, "gw-a", 20, -70.0).await.unwrap();

        let stale = resolver.resolve(DEV, "gw-b", 19, -50.0).await.unwrap();
        assert!(stale.conflict);
        assert_eq!(stale.current_fcnt_up, Some(20));
        assert_eq!(stale.preferred_gateway_id.as_deref(), Some("gw-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_uplink_reelects() {
        let store = DeterministicCacheStore::new();
        let resolver = resolver(&store);
        resolver.resolve(DEV, "gw-a", 20, -70.0).await.unwrap();

        let next = resolver.resolve(DEV, "gw-b", 21, -90.0).await.unwrap();
        assert_eq!(next.preferred_gateway_id.as_deref(), Some("gw-b"));
        assert!(!next.conflict);
    }
}
