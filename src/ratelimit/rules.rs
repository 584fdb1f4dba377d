//! Per-endpoint bucket limits.
//!
//! Limits are plain configuration: they are looked up by endpoint name and
//! passed to the store with every decision, never persisted alongside the
//! bucket. Changing a limit takes effect on the next call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::bucket::BucketLimit;
use crate::error::{Result, TollgateError};

/// Capacity applied when no limit is configured.
const DEFAULT_CAPACITY: u32 = 100;
/// Refill rate (tokens per second) applied when no limit is configured.
const DEFAULT_REFILL_RATE: f64 = 10.0;

/// Default limit plus per-endpoint overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRules {
    /// Limit used for endpoints without an override
    #[serde(default = "default_limit")]
    pub default: BucketLimit,
    /// Endpoint name to limit override
    #[serde(default)]
    pub endpoints: HashMap<String, BucketLimit>,
}

impl Default for LimitRules {
    fn default() -> Self {
        Self {
            default: default_limit(),
            endpoints: HashMap::new(),
        }
    }
}

fn default_limit() -> BucketLimit {
    BucketLimit::new(DEFAULT_CAPACITY, DEFAULT_REFILL_RATE)
}

impl LimitRules {
    /// Rules with the given default and no overrides.
    pub fn new(default: BucketLimit) -> Self {
        Self {
            default,
            endpoints: HashMap::new(),
        }
    }

    /// Add or replace an endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, limit: BucketLimit) -> Self {
        self.endpoints.insert(endpoint.into(), limit);
        self
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: LimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Validate the default and every override.
    pub fn validate(&self) -> Result<()> {
        self.default
            .validate()
            .map_err(|e| TollgateError::Config(format!("default limit: {}", e)))?;

        for (endpoint, limit) in &self.endpoints {
            if endpoint.is_empty() {
                return Err(TollgateError::Config(
                    "endpoint override with empty name".to_string(),
                ));
            }
            limit
                .validate()
                .map_err(|e| TollgateError::Config(format!("endpoint {}: {}", endpoint, e)))?;
        }

        Ok(())
    }

    /// The limit that applies to `endpoint`.
    pub fn for_endpoint(&self, endpoint: &str) -> BucketLimit {
        self.endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.default)
    }
}
