use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    ConfigError, RateLimiter,
    delivery::DEFAULT_LOCK_TTL,
    scanner::{DEFAULT_MAX_FETCH_SIZE, DEFAULT_MAX_LOOKAHEAD},
    types::BlockHeight,
};

/// Process-level scanner configuration, usually loaded from YAML.
///
/// ```yaml
/// eventTypes:
///   - A.0b2a3299cc857e29.TopShot.Deposit
/// accessNode: https://rest-mainnet.onflow.org
/// maxRequestsPerSecond: 10
/// defaultStartHeight: 40000000
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerConfig {
    pub event_types: Vec<String>,
    /// Ledger access node endpoint, passed through to the embedder's client.
    #[serde(default)]
    pub access_node: String,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    #[serde(default)]
    pub default_start_height: Option<BlockHeight>,
    #[serde(default = "default_max_fetch_size")]
    pub max_fetch_size: u64,
    #[serde(default = "default_max_lookahead")]
    pub max_lookahead: u64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

fn default_max_requests_per_second() -> u32 {
    10
}

fn default_max_fetch_size() -> u64 {
    DEFAULT_MAX_FETCH_SIZE
}

fn default_max_lookahead() -> u64 {
    DEFAULT_MAX_LOOKAHEAD
}

fn default_lock_ttl_ms() -> u64 {
    u64::try_from(DEFAULT_LOCK_TTL.as_millis()).unwrap_or(u64::MAX)
}

impl ScannerConfig {
    /// Reads a YAML config file.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Io`] - if the file cannot be read.
    /// * [`ConfigError::Parse`] - if it is not a valid config.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses a YAML config.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Parse`] - if `yaml` is not a valid config.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// A rate limiter admitting `max_requests_per_second` requests per second, with a burst of
    /// the same size.
    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        let rate = f64::from(self.max_requests_per_second);
        RateLimiter::new(rate, rate)
    }

    #[must_use]
    pub fn lock_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_ttl_ms)
    }
}
