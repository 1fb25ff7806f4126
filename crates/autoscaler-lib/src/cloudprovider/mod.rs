//! Cloud provider integration
//!
//! This module provides:
//! - The `ProviderAdapter` contract implemented by the native and Heat adapters
//! - The orchestrator-facing `NodeGroup` contract and its engine-backed implementation
//! - The `CloudProvider` that discovers, registers and refreshes node groups

pub mod api;
pub mod discovery;
pub mod heat;
pub mod minions;
pub mod native;
pub mod node_group;
pub mod provider;
pub mod provider_id;

#[cfg(test)]
pub(crate) mod fixtures;

pub use api::{ComputeApi, ContainerInfraApi, OrchestrationApi};
pub use discovery::{AutoDiscoveryConfig, DiscoveryMode, StaticGroupSpec};
pub use heat::{HeatAdapter, HeatSettings};
pub use native::NativeAdapter;
pub use node_group::{EngineSettings, ManagedNodeGroup};
pub use provider::{CloudProvider, RefreshOutcome};

use crate::error::ProviderResult;
use crate::models::{DiscoveredGroup, Instance, NodeHandle, NodeRef, NodeTemplate};
use async_trait::async_trait;
use tokio::time::Instant;

/// Capability set every provider adapter exposes to the engine.
///
/// `group_id` is always the stable node-group identifier.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short adapter name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Current node count of a group
    async fn size(&self, group_id: &str) -> ProviderResult<i64>;

    /// Starts a resize of the group to `count` nodes.
    async fn update_size(&self, group_id: &str, count: i64) -> ProviderResult<()>;

    async fn list_instances(&self, group_id: &str) -> ProviderResult<Vec<Instance>>;

    /// Removes the given nodes, leaving `new_count` nodes in the group.
    /// Waiting adapters stop at `deadline`.
    async fn delete_instances(
        &self,
        group_id: &str,
        nodes: &[NodeRef],
        new_count: i64,
        deadline: Instant,
    ) -> ProviderResult<()>;

    /// Lists node groups eligible for autoscaling that match any selector.
    async fn discover_groups(
        &self,
        configs: &[AutoDiscoveryConfig],
    ) -> ProviderResult<Vec<DiscoveredGroup>>;

    /// Returns `(unique id, stable id)` for a group name or id.
    async fn identify(&self, group: &str) -> ProviderResult<(String, String)>;

    /// Returns the stable id of the group owning a node.
    async fn owner_of(&self, node: &NodeHandle) -> ProviderResult<String>;

    /// Whether the provider-side object accepts a mutation, with its status.
    async fn can_mutate(&self) -> ProviderResult<(bool, String)>;

    /// Waits for a size update to settle. Adapters whose resize is
    /// synchronous on the control plane return immediately.
    async fn wait_for_resize(&self, _deadline: Instant) -> ProviderResult<()> {
        Ok(())
    }

    /// Called when a group is registered, before it serves requests.
    async fn prepare_group(&self, _group_id: &str) -> ProviderResult<()> {
        Ok(())
    }

    /// Drops cached state for a group that is no longer registered.
    fn forget_group(&self, _group_id: &str) {}

    async fn template_node_info(&self, group: &DiscoveredGroup) -> ProviderResult<NodeTemplate>;
}

/// Orchestrator-facing node group contract
#[async_trait]
pub trait NodeGroup: Send + Sync {
    /// Unique id, `<name>-<first 8 chars of stable id>`
    fn id(&self) -> &str;

    fn min_size(&self) -> i64;

    fn max_size(&self) -> i64;

    fn target_size(&self) -> i64;

    async fn increase_size(&self, delta: i64) -> ProviderResult<()>;

    async fn delete_nodes(&self, nodes: Vec<NodeRef>) -> ProviderResult<()>;

    async fn decrease_target_size(&self, delta: i64) -> ProviderResult<()>;

    async fn nodes(&self) -> ProviderResult<Vec<Instance>>;

    async fn template_node_info(&self) -> ProviderResult<NodeTemplate>;

    fn exist(&self) -> bool {
        true
    }

    fn autoprovisioned(&self) -> bool {
        false
    }
}
