use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::core::chain::{ChainProfile, NetworkRegistry};

const ENV_PREFIX: &str = "HWSIGNER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

/// Device session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for a single transport open (ms)
    #[serde(default = "SessionConfig::default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Timeout for one device operation, including on-device confirmation (ms)
    #[serde(default = "SessionConfig::default_device_op_timeout_ms")]
    pub device_op_timeout_ms: u64,

    /// Failed opens tolerated before DeviceUnavailable
    #[serde(default = "SessionConfig::default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Delay between failed opens (ms)
    #[serde(default = "SessionConfig::default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// How long a signing request waits for its turn on the device (ms)
    #[serde(default = "SessionConfig::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl SessionConfig {
    fn default_open_timeout_ms() -> u64 { 5_000 }
    fn default_device_op_timeout_ms() -> u64 { 120_000 }
    fn default_max_connect_attempts() -> u32 { 3 }
    fn default_connect_backoff_ms() -> u64 { 250 }
    fn default_acquire_timeout_ms() -> u64 { 600_000 }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn device_op_timeout(&self) -> Duration {
        Duration::from_millis(self.device_op_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: Self::default_open_timeout_ms(),
            device_op_timeout_ms: Self::default_device_op_timeout_ms(),
            max_connect_attempts: Self::default_max_connect_attempts(),
            connect_backoff_ms: Self::default_connect_backoff_ms(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
        }
    }
}

/// Transaction assembly configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Safety margin added on top of gas / compute estimates (percent)
    #[serde(default = "AssemblyConfig::default_gas_margin_percent")]
    pub gas_margin_percent: u64,

    /// Compute unit limit used when no estimate is available
    #[serde(default = "AssemblyConfig::default_solana_compute_unit_limit")]
    pub solana_compute_unit_limit: u32,

    /// Emit explicit compute-budget instructions for Solana transactions
    #[serde(default = "AssemblyConfig::default_solana_compute_budget")]
    pub solana_compute_budget: bool,

    /// Re-check nonce / blockhash freshness right before signing
    #[serde(default = "AssemblyConfig::default_check_staleness")]
    pub check_staleness: bool,
}

impl AssemblyConfig {
    fn default_gas_margin_percent() -> u64 { 20 }
    fn default_solana_compute_unit_limit() -> u32 { 200_000 }
    fn default_solana_compute_budget() -> bool { true }
    fn default_check_staleness() -> bool { true }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            gas_margin_percent: Self::default_gas_margin_percent(),
            solana_compute_unit_limit: Self::default_solana_compute_unit_limit(),
            solana_compute_budget: Self::default_solana_compute_budget(),
            check_staleness: Self::default_check_staleness(),
        }
    }
}

/// Top-level signer configuration.
///
/// ```toml
/// [session]
/// open_timeout_ms = 3000
///
/// [assembly]
/// gas_margin_percent = 25
///
/// [[networks]]
/// key = "anvil"
/// ...
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignerConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    /// Extra or replacement network profiles, merged over the built-in ones
    #[serde(default)]
    pub networks: Vec<ChainProfile>,
}

impl SignerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Applies `HWSIGNER_*` environment variables on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key: key.to_string(), value })
        }

        let read = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((k, v)) = read("OPEN_TIMEOUT_MS") {
            self.session.open_timeout_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = read("DEVICE_OP_TIMEOUT_MS") {
            self.session.device_op_timeout_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = read("MAX_CONNECT_ATTEMPTS") {
            self.session.max_connect_attempts = parse(&k, v)?;
        }
        if let Some((k, v)) = read("CONNECT_BACKOFF_MS") {
            self.session.connect_backoff_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = read("ACQUIRE_TIMEOUT_MS") {
            self.session.acquire_timeout_ms = parse(&k, v)?;
        }
        if let Some((k, v)) = read("GAS_MARGIN_PERCENT") {
            self.assembly.gas_margin_percent = parse(&k, v)?;
        }
        if let Some((k, v)) = read("CHECK_STALENESS") {
            self.assembly.check_staleness = parse(&k, v)?;
        }
        Ok(())
    }

    /// Built-in networks with the configured profiles merged in.
    pub fn registry(&self) -> NetworkRegistry {
        let mut registry = NetworkRegistry::builtin();
        for profile in &self.networks {
            registry.insert(profile.clone());
        }
        registry
    }
}
