//! Node-group discovery options
//!
//! Two mutually exclusive ways to tell the autoscaler which groups to manage:
//! auto-discovery selectors of the form `magnum:role=worker,gpu`, or static
//! specs of the form `min:max:name`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme token of the active provider
pub const PROVIDER_SCHEME: &str = "magnum";

const ROLE_KEY: &str = "role";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoverySpecError {
    #[error("spec {spec:?} should have exactly one ':'")]
    Colons { spec: String },

    #[error("unsupported discovery scheme {scheme:?}, expected {expected:?}")]
    Scheme { scheme: String, expected: String },

    #[error("spec {spec:?} should have exactly one '='")]
    Equals { spec: String },

    #[error("unsupported discovery key {0:?}, only \"role\" is supported")]
    Key(String),

    #[error("empty value in spec {0:?}")]
    EmptyValue(String),

    #[error("invalid node group spec {spec:?}: {reason}")]
    Static { spec: String, reason: String },

    #[error("static node group specs and auto-discovery can not be used together")]
    Conflict,

    #[error("no node group discovery options specified")]
    Missing,
}

/// Auto-discovery selector matching node groups by role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDiscoveryConfig {
    pub roles: Vec<String>,
}

impl AutoDiscoveryConfig {
    pub fn matches(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Parses `<scheme>:role=<r>[,<r>...]`.
pub fn parse_selector(spec: &str) -> Result<AutoDiscoveryConfig, DiscoverySpecError> {
    if spec.matches(':').count() != 1 {
        return Err(DiscoverySpecError::Colons {
            spec: spec.to_string(),
        });
    }
    let (scheme, filter) = spec.split_once(':').unwrap_or_default();
    if scheme != PROVIDER_SCHEME {
        return Err(DiscoverySpecError::Scheme {
            scheme: scheme.to_string(),
            expected: PROVIDER_SCHEME.to_string(),
        });
    }

    if filter.matches('=').count() != 1 {
        return Err(DiscoverySpecError::Equals {
            spec: spec.to_string(),
        });
    }
    let (key, values) = filter.split_once('=').unwrap_or_default();
    if key != ROLE_KEY {
        return Err(DiscoverySpecError::Key(key.to_string()));
    }
    if values.is_empty() {
        return Err(DiscoverySpecError::EmptyValue(spec.to_string()));
    }

    let mut roles = Vec::new();
    for role in values.split(',') {
        if role.is_empty() {
            return Err(DiscoverySpecError::EmptyValue(spec.to_string()));
        }
        roles.push(role.to_string());
    }

    Ok(AutoDiscoveryConfig { roles })
}

pub fn parse_selectors(specs: &[String]) -> Result<Vec<AutoDiscoveryConfig>, DiscoverySpecError> {
    specs.iter().map(|s| parse_selector(s)).collect()
}

/// Statically configured node group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticGroupSpec {
    pub min_size: i64,
    pub max_size: i64,
    pub name: String,
}

/// Parses `min:max:name`. A minimum of zero is only accepted when scale to
/// zero is enabled.
pub fn parse_static_spec(
    spec: &str,
    scale_to_zero: bool,
) -> Result<StaticGroupSpec, DiscoverySpecError> {
    let invalid = |reason: &str| DiscoverySpecError::Static {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(invalid("expected min:max:name"));
    }

    let min_size: i64 = parts[0]
        .parse()
        .map_err(|_| invalid("min size is not an integer"))?;
    let max_size: i64 = parts[1]
        .parse()
        .map_err(|_| invalid("max size is not an integer"))?;
    let name = parts[2].trim();

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if min_size < 0 {
        return Err(invalid("min size must be >= 0"));
    }
    if min_size == 0 && !scale_to_zero {
        return Err(invalid("min size must be >= 1 unless scale to zero is enabled"));
    }
    if max_size < min_size {
        return Err(invalid("max size must be >= min size"));
    }

    Ok(StaticGroupSpec {
        min_size,
        max_size,
        name: name.to_string(),
    })
}

/// Which discovery mode is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    Static(Vec<StaticGroupSpec>),
    Auto(Vec<AutoDiscoveryConfig>),
}

impl DiscoveryMode {
    pub fn from_specs(
        static_specs: &[String],
        selectors: &[String],
        scale_to_zero: bool,
    ) -> Result<Self, DiscoverySpecError> {
        match (static_specs.is_empty(), selectors.is_empty()) {
            (false, false) => Err(DiscoverySpecError::Conflict),
            (true, true) => Err(DiscoverySpecError::Missing),
            (false, true) => static_specs
                .iter()
                .map(|s| parse_static_spec(s, scale_to_zero))
                .collect::<Result<Vec<_>, _>>()
                .map(DiscoveryMode::Static),
            (true, false) => parse_selectors(selectors).map(DiscoveryMode::Auto),
        }
    }
}
