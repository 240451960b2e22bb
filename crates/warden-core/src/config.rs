//! Typed, file-loaded configuration for the engine.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    FileRead(PathBuf, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("unsupported config version: {0} (expected \"1\")")]
    UnsupportedVersion(String),

    #[error("invalid app address {0:?}: {1}")]
    InvalidAddress(String, AddressError),

    #[error("app name cannot be empty")]
    EmptyAppName,

    #[error("app name {0:?} contains invalid characters")]
    InvalidAppName(String),
}

/// Root of the configuration file the engine is started with: `app.*` keys
/// mirror the sections below.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub version: String,
    pub app: AppConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,

    /// Canonical host address, e.g. `warden://myapp/primary`. Service
    /// addresses are this address with the service's slug appended.
    pub address: String,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub stats: StatsSection,

    #[serde(default)]
    pub services: ServicesSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Minimum spacing between successive ticks dispatched to a container;
    /// `0` (the default) means tick as fast as the engine's own loop runs.
    #[serde(with = "humantime_serde", default = "default_throttle_ticks")]
    pub throttle_ticks: Duration,

    /// Default retry policy applied to a service that didn't set its own.
    #[serde(default = "default_true")]
    pub retry_on_error: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            throttle_ticks: default_throttle_ticks(),
            retry_on_error: default_true(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(with = "humantime_serde", default = "default_stats_interval")]
    pub sample_interval: Duration,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval: default_stats_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesSection {
    #[serde(with = "humantime_serde", default = "default_loader_timeout")]
    pub loader_timeout: Duration,

    /// Whether a service's cron setup hook fires immediately once the
    /// service finishes starting, rather than waiting for its first schedule tick.
    #[serde(default)]
    pub cron_on_service_start: bool,
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            loader_timeout: default_loader_timeout(),
            cron_on_service_start: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_throttle_ticks() -> Duration {
    Duration::ZERO
}

fn default_max_retries() -> u32 {
    4
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(10)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_loader_timeout() -> Duration {
    Duration::from_secs(30)
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != "1" {
            return Err(ConfigError::UnsupportedVersion(self.version.clone()));
        }
        if self.app.name.is_empty() {
            return Err(ConfigError::EmptyAppName);
        }
        if !self
            .app
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidAppName(self.app.name.clone()));
        }
        self.host_address()?;
        Ok(())
    }

    /// Parse and validate `app.address` without caching it, so a config
    /// reload always reflects the file on disk.
    pub fn host_address(&self) -> Result<Address, ConfigError> {
        Address::from_str(&self.app.address)
            .map_err(|e| ConfigError::InvalidAddress(self.app.address.clone(), e))
    }
}
