//! Core data models shared by the provider adapters and the node-group engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of an instance as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Running,
    Deleting,
}

/// Classification of an instance creation error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    OutOfResources,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceErrorInfo {
    pub class: ErrorClass,
    pub message: String,
}

impl InstanceErrorInfo {
    /// Builds error info from a provider status reason. Quota failures are
    /// reported as out of resources.
    pub fn from_status_reason(reason: &str) -> Self {
        let class = if reason.to_lowercase().contains("quota") {
            ErrorClass::OutOfResources
        } else {
            ErrorClass::Other
        };
        Self {
            class,
            message: reason.to_string(),
        }
    }
}

/// Orchestrator-facing projection of a minion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InstanceErrorInfo>,
}

impl Instance {
    pub fn new(id: impl Into<String>, state: InstanceState) -> Self {
        Self {
            id: id.into(),
            state,
            error: None,
        }
    }

    pub fn with_error(mut self, error: InstanceErrorInfo) -> Self {
        self.error = Some(error);
        self
    }
}

/// Node handle supplied by the orchestrator when it deletes nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
    /// Machine UUID as reported by the kubelet. May lack hyphens.
    pub machine_id: String,
    pub provider_id: String,
    pub ips: Vec<String>,
}

/// Node handle used for ownership lookups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHandle {
    pub name: String,
    pub provider_id: String,
    pub labels: HashMap<String, String>,
}

/// A node group as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredGroup {
    /// Stable identifier (UUID)
    pub id: String,
    pub name: String,
    pub role: String,
    pub node_count: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub flavor_id: String,
    pub labels: HashMap<String, String>,
}

impl DiscoveredGroup {
    /// `<name>-<first 8 chars of id>`
    pub fn unique_id(&self) -> String {
        unique_id(&self.name, &self.id)
    }
}

/// Builds the unique node-group id from a name and a stable identifier.
pub fn unique_id(name: &str, id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    format!("{}-{}", name, prefix)
}

/// Template of a node that a group would create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub cpu_cores: u32,
    pub ram_megabytes: u64,
    pub disk_gigabytes: u64,
    pub labels: HashMap<String, String>,
}

/// Status summary of a registered node group, served over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroupStatus {
    pub id: String,
    pub uuid: String,
    pub min_size: i64,
    pub max_size: i64,
    pub target_size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_uses_first_eight_chars() {
        assert_eq!(
            unique_id("default-worker", "3d4bbc26-0ab6-4d3b-b4c9-2bc06a47d5ce"),
            "default-worker-3d4bbc26"
        );
    }

    #[test]
    fn test_error_info_quota_is_out_of_resources() {
        let info = InstanceErrorInfo::from_status_reason("Resource CREATE failed: Out Of QUOTA");
        assert_eq!(info.class, ErrorClass::OutOfResources);

        let info = InstanceErrorInfo::from_status_reason("No valid host was found");
        assert_eq!(info.class, ErrorClass::Other);
        assert_eq!(info.message, "No valid host was found");
    }

    #[test]
    fn test_instance_state_serializes_lowercase() {
        let instance = Instance::new("fake:///ng/1", InstanceState::Creating);
        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"creating\""));
        assert!(!json.contains("error"));
    }
}
