//! Facade configuration.
//!
//! Layers, lowest to highest precedence: built-in defaults, a TOML file,
//! `LORA_FACADE_*` environment variables, command-line flags. Validation runs
//! once all layers are applied.

use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use lora_cache::LockWaitConfig;
use lora_coordination::config::DevAddrSettings;
use lora_coordination::config::DeviceLockSettings;
use lora_coordination::config::JoinSettings;
use lora_coordination::config::PreferredGatewaySettings;
use lora_coordination::config::SyncSettings;
use lora_coordination::CoordinationConfig;
use lora_coordination::RegisteredDevice;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "LORA_FACADE_";

/// Configuration errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A value is out of range or unparseable.
    #[snafu(display("invalid configuration for {key}: '{value}' ({reason})"))]
    InvalidValue {
        /// Setting name.
        key: String,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A required value is empty.
    #[snafu(display("missing required configuration: {key} ({hint})"))]
    MissingRequired {
        /// Setting name.
        key: String,
        /// How to provide it.
        hint: String,
    },

    /// A configuration file could not be read.
    #[snafu(display("failed to read {}: {source}", path.display()))]
    ReadFile {
        /// File path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A configuration file is not valid TOML for its schema.
    #[snafu(display("failed to parse {}: {source}", path.display()))]
    ParseToml {
        /// File path.
        path: PathBuf,
        /// The underlying error.
        source: toml::de::Error,
    },
}

/// Lock lifetimes and the wait bound for blocking acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Device lock expiry (ms).
    pub device_lock_ttl_ms: u64,
    /// Frame-counter state lifetime (s).
    pub device_state_ttl_secs: u64,
    /// ABP resets only clear sessions past this uplink counter.
    pub abp_reset_min_fcnt_up: u32,
    /// How long a blocking acquisition waits (ms).
    pub wait_timeout_ms: u64,
    /// First retry delay of a blocking acquisition (ms).
    pub initial_backoff_ms: u64,
    /// Largest retry delay of a blocking acquisition (ms).
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        let device = DeviceLockSettings::default();
        let wait = LockWaitConfig::default();
        Self {
            device_lock_ttl_ms: device.lock_ttl_ms,
            device_state_ttl_secs: device.state_ttl_secs,
            abp_reset_min_fcnt_up: device.abp_reset_min_fcnt_up,
            wait_timeout_ms: wait.timeout_ms,
            initial_backoff_ms: wait.initial_backoff_ms,
            max_backoff_ms: wait.max_backoff_ms,
        }
    }
}

/// Join handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Join-info lock expiry (s).
    pub info_lock_ttl_secs: u64,
    /// Cached join-info lifetime (s).
    pub info_ttl_secs: u64,
    /// Consumed nonce marker lifetime (s).
    pub nonce_ttl_secs: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        let join = JoinSettings::default();
        Self {
            info_lock_ttl_secs: join.info_lock_ttl_secs,
            info_ttl_secs: join.info_ttl_secs,
            nonce_ttl_secs: join.nonce_ttl_secs,
        }
    }
}

/// Address cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevAddrConfig {
    /// Per-address lock expiry (ms).
    pub lock_ttl_ms: u64,
    /// Registry pages followed per query.
    pub max_registry_pages: u32,
}

impl Default for DevAddrConfig {
    fn default() -> Self {
        let devaddr = DevAddrSettings::default();
        Self {
            lock_ttl_ms: devaddr.lock_ttl_ms,
            max_registry_pages: devaddr.max_registry_pages,
        }
    }
}

/// Preferred gateway election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferredGatewayConfig {
    /// Candidate collection window (ms).
    pub receive_window_ms: u64,
    /// Candidate list lifetime (s).
    pub candidate_ttl_secs: u64,
    /// Elected record lifetime (s).
    pub record_ttl_secs: u64,
    /// Election lock expiry (ms).
    pub lock_ttl_ms: u64,
    /// Attempts to take the election lock.
    pub max_resolution_attempts: u32,
}

impl Default for PreferredGatewayConfig {
    fn default() -> Self {
        let settings = PreferredGatewaySettings::default();
        Self {
            receive_window_ms: settings.receive_window_ms,
            candidate_ttl_secs: settings.candidate_ttl_secs,
            record_ttl_secs: settings.record_ttl_secs,
            lock_ttl_ms: settings.lock_ttl_ms,
            max_resolution_attempts: settings.max_resolution_attempts,
        }
    }
}

/// Scheduled address cache reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the scheduler.
    pub enabled: bool,
    /// Time between passes (s).
    pub interval_secs: u64,
    /// How long a full pass stays fresh (s).
    pub full_sync_interval_secs: u64,
    /// Reconciliation lock expiry (s).
    pub lock_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let sync = SyncSettings::default();
        Self {
            enabled: true,
            interval_secs: sync.interval_secs,
            full_sync_interval_secs: sync.full_sync_interval_secs,
            lock_ttl_secs: sync.lock_ttl_secs,
        }
    }
}

/// The in-memory device registry of the development node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TOML file with `[[devices]]` to load at startup.
    pub seed_file: Option<PathBuf>,
    /// Devices per query page.
    pub page_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            seed_file: None,
            page_size: 100,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    /// Lock owner for work not tied to a gateway.
    pub instance_id: String,
    /// Lock settings.
    pub locks: LockConfig,
    /// Join settings.
    pub join: JoinConfig,
    /// Address cache settings.
    pub devaddr: DevAddrConfig,
    /// Preferred gateway settings.
    pub preferred_gateway: PreferredGatewayConfig,
    /// Reconciliation settings.
    pub sync: SyncConfig,
    /// Registry settings.
    pub registry: RegistryConfig,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            instance_id: CoordinationConfig::default().instance_id,
            locks: LockConfig::default(),
            join: JoinConfig::default(),
            devaddr: DevAddrConfig::default(),
            preferred_gateway: PreferredGatewayConfig::default(),
            sync: SyncConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl FacadeConfig {
    /// Parse a TOML file. Missing sections and keys take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&contents).context(ParseTomlSnafu { path })
    }

    /// Defaults, then `path` if given, then environment overrides.
    ///
    /// Not validated: apply command-line overrides first, then call
    /// [`validate`](Self::validate).
    pub fn load_with_layers(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading configuration file");
                Self::from_toml_file(path)?
            }
            None => {
                tracing::info!("no configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `LORA_FACADE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps full variable names to values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let env = Overrides { lookup };

        if let Some(value) = env.get("INSTANCE_ID") {
            self.instance_id = value;
        }
        env.parse("DEVICE_LOCK_TTL_MS", &mut self.locks.device_lock_ttl_ms)?;
        env.parse("DEVICE_STATE_TTL_SECS", &mut self.locks.device_state_ttl_secs)?;
        env.parse("LOCK_WAIT_TIMEOUT_MS", &mut self.locks.wait_timeout_ms)?;
        env.parse("JOIN_INFO_TTL_SECS", &mut self.join.info_ttl_secs)?;
        env.parse("DEV_NONCE_TTL_SECS", &mut self.join.nonce_ttl_secs)?;
        env.parse("DEVADDR_LOCK_TTL_MS", &mut self.devaddr.lock_ttl_ms)?;
        env.parse("RECEIVE_WINDOW_MS", &mut self.preferred_gateway.receive_window_ms)?;
        env.parse("SYNC_ENABLED", &mut self.sync.enabled)?;
        env.parse("SYNC_INTERVAL_SECS", &mut self.sync.interval_secs)?;
        if let Some(value) = env.get("REGISTRY_SEED_FILE") {
            self.registry.seed_file = Some(PathBuf::from(value));
        }
        env.parse("REGISTRY_PAGE_SIZE", &mut self.registry.page_size)?;
        Ok(())
    }

    /// Reject settings the coordination layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "instance_id".to_string(),
                hint: format!("set it in the config file or {ENV_PREFIX}INSTANCE_ID"),
            });
        }

        let positive: [(&str, u64); 12] = [
            ("locks.device_lock_ttl_ms", self.locks.device_lock_ttl_ms),
            ("locks.device_state_ttl_secs", self.locks.device_state_ttl_secs),
            ("locks.wait_timeout_ms", self.locks.wait_timeout_ms),
            ("locks.initial_backoff_ms", self.locks.initial_backoff_ms),
            ("join.info_lock_ttl_secs", self.join.info_lock_ttl_secs),
            ("join.info_ttl_secs", self.join.info_ttl_secs),
            ("join.nonce_ttl_secs", self.join.nonce_ttl_secs),
            ("devaddr.lock_ttl_ms", self.devaddr.lock_ttl_ms),
            ("preferred_gateway.lock_ttl_ms", self.preferred_gateway.lock_ttl_ms),
            ("preferred_gateway.candidate_ttl_secs", self.preferred_gateway.candidate_ttl_secs),
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.lock_ttl_secs", self.sync.lock_ttl_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, value, "must be greater than zero"));
            }
        }

        if self.locks.initial_backoff_ms > self.locks.max_backoff_ms {
            return Err(invalid(
                "locks.max_backoff_ms",
                self.locks.max_backoff_ms,
                "must not be smaller than locks.initial_backoff_ms",
            ));
        }
        if self.preferred_gateway.candidate_ttl_secs.saturating_mul(1000) <= self.preferred_gateway.receive_window_ms {
            return Err(invalid(
                "preferred_gateway.candidate_ttl_secs",
                self.preferred_gateway.candidate_ttl_secs,
                "candidates must outlive the receive window",
            ));
        }
        if self.preferred_gateway.max_resolution_attempts == 0 {
            return Err(invalid("preferred_gateway.max_resolution_attempts", 0, "must be at least 1"));
        }
        if self.devaddr.max_registry_pages == 0 {
            return Err(invalid("devaddr.max_registry_pages", 0, "must be at least 1"));
        }
        if self.registry.page_size == 0 {
            return Err(invalid("registry.page_size", 0, "must be at least 1"));
        }
        Ok(())
    }

    /// Settings for the coordination components.
    pub fn coordination(&self) -> CoordinationConfig {
        CoordinationConfig {
            instance_id: self.instance_id.clone(),
            device: DeviceLockSettings {
                lock_ttl_ms: self.locks.device_lock_ttl_ms,
                state_ttl_secs: self.locks.device_state_ttl_secs,
                abp_reset_min_fcnt_up: self.locks.abp_reset_min_fcnt_up,
            },
            join: JoinSettings {
                info_lock_ttl_secs: self.join.info_lock_ttl_secs,
                info_ttl_secs: self.join.info_ttl_secs,
                nonce_ttl_secs: self.join.nonce_ttl_secs,
            },
            devaddr: DevAddrSettings {
                lock_ttl_ms: self.devaddr.lock_ttl_ms,
                max_registry_pages: self.devaddr.max_registry_pages,
            },
            sync: SyncSettings {
                interval_secs: self.sync.interval_secs,
                full_sync_interval_secs: self.sync.full_sync_interval_secs,
                lock_ttl_secs: self.sync.lock_ttl_secs,
            },
            preferred_gateway: PreferredGatewaySettings {
                receive_window_ms: self.preferred_gateway.receive_window_ms,
                candidate_ttl_secs: self.preferred_gateway.candidate_ttl_secs,
                record_ttl_secs: self.preferred_gateway.record_ttl_secs,
                lock_ttl_ms: self.preferred_gateway.lock_ttl_ms,
                max_resolution_attempts: self.preferred_gateway.max_resolution_attempts,
            },
        }
    }

    /// Wait bound for blocking lock acquisition.
    pub fn lock_wait(&self) -> LockWaitConfig {
        LockWaitConfig {
            timeout_ms: self.locks.wait_timeout_ms,
            initial_backoff_ms: self.locks.initial_backoff_ms,
            max_backoff_ms: self.locks.max_backoff_ms,
        }
    }
}

/// Contents of a registry seed file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySeed {
    /// Devices to register.
    #[serde(default)]
    pub devices: Vec<RegisteredDevice>,
}

impl RegistrySeed {
    /// Parse a seed file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&contents).context(ParseTomlSnafu { path })
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
    }

    fn parse<T>(&self, name: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.get(name) else {
            return Ok(());
        };
        *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            value: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

fn invalid(key: &str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use lora_coordination::DevAddr;
    use lora_coordination::DevEui;

    use super::*;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = FacadeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.coordination().device.lock_ttl_ms, 10_000);
        assert_eq!(config.lock_wait(), LockWaitConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let file = write_file(
            r#"
instance_id = "lns-west"

[join]
nonce_ttl_secs = 60

[sync]
enabled = false
"#,
        );
        let config = FacadeConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.instance_id, "lns-west");
        assert_eq!(config.join.nonce_ttl_secs, 60);
        assert_eq!(config.join.info_ttl_secs, JoinConfig::default().info_ttl_secs);
        assert!(!config.sync.enabled);
        assert_eq!(config.locks, LockConfig::default());
    }

    #[test]
    fn test_bad_toml_reports_path() {
        let file = write_file("instance_id = [");
        let err = FacadeConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = write_file("instance_id = \"from-file\"\n[sync]\ninterval_secs = 60\n");
        let mut config = FacadeConfig::from_toml_file(file.path()).unwrap();
        let vars: BTreeMap<String, String> = [
            ("LORA_FACADE_INSTANCE_ID", "from-env"),
            ("LORA_FACADE_SYNC_INTERVAL_SECS", "30"),
            ("LORA_FACADE_SYNC_ENABLED", "false"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_overrides(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.instance_id, "from-env");
        assert_eq!(config.sync.interval_secs, 30);
        assert!(!config.sync.enabled);
    }

    #[test]
    fn test_unparseable_override() {
        let mut config = FacadeConfig::default();
        let err = config
            .apply_overrides(|name| (name == "LORA_FACADE_DEVICE_LOCK_TTL_MS").then(|| "soon".to_string()))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "LORA_FACADE_DEVICE_LOCK_TTL_MS");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_validation() {
        let mut config = FacadeConfig::default();
        config.instance_id = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired { .. })));

        let mut config = FacadeConfig::default();
        config.locks.device_lock_ttl_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { key, .. }) if key == "locks.device_lock_ttl_ms"));

        let mut config = FacadeConfig::default();
        config.locks.initial_backoff_ms = 1_000;
        config.locks.max_backoff_ms = 10;
        assert!(config.validate().is_err());

        let mut config = FacadeConfig::default();
        config.preferred_gateway.candidate_ttl_secs = 1;
        config.preferred_gateway.receive_window_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registry_seed() {
        let file = write_file(
            r#"
[[devices]]
dev_eui = "00-00-00-00-00-00-00-2A"
dev_addr = "26011234"
primary_credential = "secret"
gateway_id = "gw-1"

[[devices]]
dev_eui = "000000000000002B"
primary_credential = "other"
"#,
        );
        let seed = RegistrySeed::from_toml_file(file.path()).unwrap();
        assert_eq!(seed.devices.len(), 2);
        assert_eq!(seed.devices[0].dev_eui, DevEui(42));
        assert_eq!(seed.devices[0].dev_addr, Some(DevAddr(0x2601_1234)));
        assert_eq!(seed.devices[1].gateway_id, None);
    }
}
