//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimitRules, OutagePolicy, DEFAULT_KEY_PREFIX};
use crate::store::RedisStoreConfig;
use crate::usage::UsageQueueConfig;

/// Prefix of environment variables that override file settings,
/// e.g. `TOLLGATE__STORE__REDIS__URL`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Default and per-endpoint bucket limits
    #[serde(default)]
    pub limits: LimitRules,

    /// Separate YAML file holding the limit rules; replaces `limits` when set
    #[serde(default)]
    pub limits_file: Option<PathBuf>,

    /// Behaviour while the store is unavailable
    #[serde(default)]
    pub outage: OutagePolicy,

    /// Usage event queue
    #[serde(default)]
    pub usage: UsageQueueConfig,
}

/// Which store holds bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    Redis,
    /// This process only
    Memory,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Namespace prefix of bucket keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Idle time after which a bucket expires and starts over full
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    #[serde(default)]
    pub redis: RedisStoreConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            key_prefix: default_key_prefix(),
            idle_ttl_secs: default_idle_ttl(),
            redis: RedisStoreConfig::default(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_idle_ttl() -> u64 {
    3600
}

impl StoreConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TOLLGATE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);
        Self::load_with_env(path, env)
    }

    /// Layer `env` over the YAML file at `path`.
    ///
    /// The `config` crate lowercases keys, so `limits.endpoints` is always
    /// taken from the file (or `limits_file`) and cannot be set through the
    /// environment. Scalar settings, including `limits.default`, can.
    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let base = match path {
            Some(path) => Self::parse_yaml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };

        let file_source = config::Config::try_from(&base)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        let mut config: TollgateConfig = config::Config::builder()
            .add_source(file_source)
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        config.limits.endpoints = base.limits.endpoints;
        config.apply_limits_file()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config = Self::parse_yaml(yaml)?;
        config.apply_limits_file()?;
        config.validate()?;
        Ok(config)
    }

    fn parse_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Replace `limits` with the contents of `limits_file`, if set.
    fn apply_limits_file(&mut self) -> Result<()> {
        if let Some(path) = &self.limits_file {
            self.limits = LimitRules::from_file(path)?;
        }
        Ok(())
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.store.key_prefix.is_empty() {
            return Err(TollgateError::Config("store.key_prefix must not be empty".to_string()));
        }
        if self.store.idle_ttl_secs == 0 {
            return Err(TollgateError::Config(
                "store.idle_ttl_secs must be greater than zero".to_string(),
            ));
        }

        let redis = &self.store.redis;
        if self.store.backend == StoreBackend::Redis {
            if redis.pool_size == 0 {
                return Err(TollgateError::Config(
                    "store.redis.pool_size must be greater than zero".to_string(),
                ));
            }
            if redis.response_timeout_ms == 0 || redis.connect_timeout_ms == 0 {
                return Err(TollgateError::Config(
                    "store.redis timeouts must be greater than zero".to_string(),
                ));
            }
        }

        if self.usage.capacity == 0 || self.usage.max_in_flight == 0 {
            return Err(TollgateError::Config(
                "usage.capacity and usage.max_in_flight must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
