//! Cloud API collaborators
//!
//! The adapters talk to three services: the container-infra service that owns
//! clusters and node groups, the orchestration service that owns stacks and
//! their resources, and the compute service for flavors. Each is a trait so the
//! adapters can be driven by the HTTP client in production and by in-memory
//! fakes in tests.

use crate::error::ProviderResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status values reported by clusters and stacks
pub mod status {
    pub const CREATE_IN_PROGRESS: &str = "CREATE_IN_PROGRESS";
    pub const CREATE_COMPLETE: &str = "CREATE_COMPLETE";
    pub const CREATE_FAILED: &str = "CREATE_FAILED";
    pub const INIT_COMPLETE: &str = "INIT_COMPLETE";
    pub const UPDATE_IN_PROGRESS: &str = "UPDATE_IN_PROGRESS";
    pub const UPDATE_COMPLETE: &str = "UPDATE_COMPLETE";
    pub const UPDATE_FAILED: &str = "UPDATE_FAILED";
    pub const DELETE_IN_PROGRESS: &str = "DELETE_IN_PROGRESS";
    pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

    /// Statuses in which a cluster does not accept a new update.
    pub const PREVENTING_UPDATE: &[&str] = &[UPDATE_IN_PROGRESS, UPDATE_FAILED];

    pub fn prevents_update(status: &str) -> bool {
        PREVENTING_UPDATE.contains(&status)
    }
}

/// Role of the node group hosting the control plane
pub const MASTER_ROLE: &str = "master";

/// Name of the cluster stack resource holding the nested minions stack
pub const KUBE_MINIONS_RESOURCE: &str = "kube_minions";

/// Stack output mapping minion index to server identity
pub const REFS_MAP_OUTPUT: &str = "refs_map";

/// Value a refs-map entry holds once server creation has started
pub const CREATION_SENTINEL: &str = "kube-minion";

/// Nested resource names inside a single minion stack
pub const MINION_SERVER_RESOURCE: &str = "kube-minion";
pub const MINION_DEPLOYMENT_RESOURCE: &str = "node_config_deployment";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub uuid: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub status_reason: Option<String>,
    pub node_count: i64,
    #[serde(default)]
    pub stack_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupDetail {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub node_count: i64,
    #[serde(default)]
    pub min_node_count: i64,
    /// Only returned by a single-group get. A missing maximum means the
    /// group is not eligible for autoscaling.
    #[serde(default)]
    pub max_node_count: Option<i64>,
    #[serde(default)]
    pub flavor_id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub stack_id: String,
    #[serde(default)]
    pub status: String,
}

/// Name and id of an orchestration stack. Both are needed to address it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackRef {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackOutput {
    pub output_key: String,
    #[serde(default)]
    pub output_value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    #[serde(rename = "stack_name")]
    pub name: String,
    #[serde(rename = "stack_status", default)]
    pub status: String,
    #[serde(rename = "stack_status_reason", default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
}

impl Stack {
    pub fn stack_ref(&self) -> StackRef {
        StackRef {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }

    /// Returns the index -> identity map from the `refs_map` output.
    ///
    /// `None` when the output is missing or not an object, which happens
    /// while the stack is being torn down.
    pub fn refs_map(&self) -> Option<HashMap<String, String>> {
        let output = self
            .outputs
            .iter()
            .find(|o| o.output_key == REFS_MAP_OUTPUT)?;
        let object = output.output_value.as_object()?;
        Some(
            object
                .iter()
                .filter_map(|(index, value)| {
                    value.as_str().map(|v| (index.clone(), v.to_string()))
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResource {
    #[serde(rename = "resource_name")]
    pub name: String,
    #[serde(rename = "physical_resource_id", default)]
    pub physical_id: String,
    #[serde(rename = "resource_status", default)]
    pub status: String,
    #[serde(rename = "resource_status_reason", default)]
    pub status_reason: String,
    #[serde(rename = "resource_type", default)]
    pub resource_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub vcpus: u32,
    /// RAM in megabytes
    pub ram: u64,
    /// Root disk in gigabytes
    pub disk: u64,
}

/// Body of a cluster resize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub node_count: i64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub nodes_to_remove: Vec<String>,
    pub nodegroup: String,
}

/// Container-infra service: clusters and node groups
#[async_trait]
pub trait ContainerInfraApi: Send + Sync {
    async fn get_cluster(&self, cluster: &str) -> ProviderResult<Cluster>;

    /// Replaces the cluster's `node_count`.
    async fn update_cluster_node_count(&self, cluster: &str, count: i64) -> ProviderResult<()>;

    async fn resize_cluster(&self, cluster: &str, request: &ResizeRequest) -> ProviderResult<()>;

    /// Lists node groups. The listing omits min/max counts.
    async fn list_node_groups(&self, cluster: &str) -> ProviderResult<Vec<NodeGroupDetail>>;

    async fn get_node_group(&self, cluster: &str, node_group: &str)
        -> ProviderResult<NodeGroupDetail>;
}

/// Orchestration service: stacks and stack resources
#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    /// Looks a stack up by name or id alone.
    async fn find_stack(&self, name_or_id: &str) -> ProviderResult<Stack>;

    async fn get_stack(&self, stack: &StackRef) -> ProviderResult<Stack>;

    async fn get_stack_resource(
        &self,
        stack: &StackRef,
        resource: &str,
    ) -> ProviderResult<StackResource>;

    async fn list_stack_resources(&self, stack: &StackRef) -> ProviderResult<Vec<StackResource>>;

    /// Lists resources of a stack known only by id.
    async fn find_stack_resources(&self, stack_id: &str) -> ProviderResult<Vec<StackResource>>;

    /// Patches stack parameters, leaving the template untouched.
    async fn patch_stack_parameters(
        &self,
        stack: &StackRef,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> ProviderResult<()>;
}

/// Compute service
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_flavor(&self, flavor_id: &str) -> ProviderResult<Flavor>;
}
