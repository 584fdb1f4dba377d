//! Bucket identity and storage key derivation.

use std::fmt;

/// Default namespace prefix for bucket keys.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Identifies the bucket for a (tenant, endpoint) pair.
///
/// Both components are case-sensitive and compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId {
    /// The tenant being limited
    pub tenant: String,
    /// The endpoint name within the tenant's API
    pub endpoint: String,
}

impl BucketId {
    /// Create a new bucket identity.
    pub fn new(tenant: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Whether either component is empty.
    pub fn is_empty(&self) -> bool {
        self.tenant.is_empty() || self.endpoint.is_empty()
    }

    /// Derive the key under which this bucket is stored.
    ///
    /// Format: `"{prefix}:{tenant}:{endpoint}"`. Components are escaped so that
    /// a `:` inside a tenant or endpoint cannot make two identities share a key.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}",
            prefix,
            escape_component(&self.tenant),
            escape_component(&self.endpoint)
        )
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.endpoint)
    }
}

fn escape_component(value: &str) -> String {
    if !value.contains(['%', ':']) {
        return value.to_string();
    }

    let mut escaped = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    escaped
}
