//! Single-group Heat adapter
//!
//! The cluster exposes one node group whose size is the cluster's
//! `node_count`. Shrinking specific machines takes two steps: patch the
//! cluster stack with the minion indices to remove, wait for the stack to
//! settle, then write the new `node_count` back to the cluster.

use super::api::{
    status, ContainerInfraApi, OrchestrationApi, StackRef, KUBE_MINIONS_RESOURCE,
};
use super::discovery::AutoDiscoveryConfig;
use super::minions::list_minion_instances;
use super::provider_id::{canonical_uuid, parse_fake};
use super::ProviderAdapter;
use crate::error::{ProviderError, ProviderResult};
use crate::models::{DiscoveredGroup, Instance, NodeHandle, NodeRef, NodeTemplate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Status-wait timing
#[derive(Debug, Clone)]
pub struct HeatSettings {
    /// How long to wait for an update to start
    pub in_progress_timeout: Duration,
    /// How long to wait for a started update to complete
    pub complete_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HeatSettings {
    fn default() -> Self {
        Self {
            in_progress_timeout: Duration::from_secs(2 * 60),
            complete_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(30),
        }
    }
}

pub struct HeatAdapter {
    cluster_id: String,
    stack: StackRef,
    minions: StackRef,
    magnum: Arc<dyn ContainerInfraApi>,
    heat: Arc<dyn OrchestrationApi>,
    settings: HeatSettings,
    /// The single registered group
    group: RwLock<Option<String>>,
}

impl HeatAdapter {
    /// Resolves the cluster, its stack and the nested kube-minions stack.
    pub async fn connect(
        cluster: &str,
        magnum: Arc<dyn ContainerInfraApi>,
        heat: Arc<dyn OrchestrationApi>,
        settings: HeatSettings,
    ) -> ProviderResult<Self> {
        let found = magnum.get_cluster(cluster).await?;
        if found.uuid != cluster {
            info!(cluster_name = %cluster, cluster_id = %found.uuid, "Using cluster UUID instead of name");
        }

        let stack = heat.find_stack(&found.stack_id).await?;
        let stack = StackRef {
            name: stack.name,
            id: found.stack_id.clone(),
        };

        let resource = heat.get_stack_resource(&stack, KUBE_MINIONS_RESOURCE).await?;
        let minions_stack = heat.find_stack(&resource.physical_id).await?;
        let minions = StackRef {
            name: minions_stack.name,
            id: resource.physical_id,
        };
        info!(name = %minions.name, id = %minions.id, "Found nested kube_minions stack");

        Ok(Self {
            cluster_id: found.uuid,
            stack,
            minions,
            magnum,
            heat,
            settings,
            group: RwLock::new(None),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn minions_stack(&self) -> &StackRef {
        &self.minions
    }

    /// Maps each node to its minion index through the inverted refs map.
    /// Fails without side effects if any node is unresolved.
    async fn find_stack_indices(&self, nodes: &[NodeRef]) -> ProviderResult<Vec<String>> {
        let stack = self.heat.get_stack(&self.minions).await?;
        let id_to_index: HashMap<String, String> = stack
            .refs_map()
            .unwrap_or_default()
            .into_iter()
            .map(|(index, id)| (id, index))
            .collect();

        let mut indices = Vec::with_capacity(nodes.len());
        let mut not_found = Vec::new();
        for node in nodes {
            match stack_index(&id_to_index, node) {
                Some(index) => {
                    debug!(node = %node.name, index = %index, "Resolved node to stack index");
                    indices.push(index);
                }
                None => {
                    debug!(node = %node.name, "Could not resolve node to a stack index");
                    not_found.push(node.name.clone());
                }
            }
        }

        if !not_found.is_empty() {
            return Err(ProviderError::Resolution(format!(
                "{} nodes could not be resolved to stack indices: {}",
                not_found.len(),
                not_found.join(", ")
            )));
        }
        Ok(indices)
    }

    /// Polls until `fetch` reports `target`, giving up after `timeout` or at
    /// `deadline`, whichever comes first.
    async fn wait_for_status<F, Fut>(
        &self,
        what: &str,
        target: &str,
        timeout: Duration,
        deadline: Instant,
        fetch: F,
    ) -> ProviderResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<String>>,
    {
        debug!(target_status = %target, "Waiting for {} status", what);
        let until = (Instant::now() + timeout).min(deadline);
        loop {
            let current = fetch().await?;
            if current == target {
                info!(status = %target, "Waited for {} status", what);
                return Ok(());
            }
            if Instant::now() >= until {
                return Err(ProviderError::Timeout(format!(
                    "timeout ({:?}) waiting for {} status {}, last status {}",
                    timeout, what, target, current
                )));
            }
            sleep_until((Instant::now() + self.settings.poll_interval).min(until)).await;
        }
    }

    async fn stack_status(&self) -> ProviderResult<String> {
        Ok(self.heat.get_stack(&self.stack).await?.status)
    }

    async fn cluster_status(&self) -> ProviderResult<String> {
        Ok(self.magnum.get_cluster(&self.cluster_id).await?.status)
    }
}

/// Finds the index of a node: first by its machine id in canonical
/// hyphenated form, then by any of its IPs.
fn stack_index(id_to_index: &HashMap<String, String>, node: &NodeRef) -> Option<String> {
    if let Some(machine_id) = canonical_uuid(&node.machine_id) {
        if let Some(index) = id_to_index.get(&machine_id) {
            return Some(index.clone());
        }
    }
    node.ips
        .iter()
        .find_map(|ip| id_to_index.get(ip))
        .cloned()
}

#[async_trait]
impl ProviderAdapter for HeatAdapter {
    fn name(&self) -> &'static str {
        "heat"
    }

    async fn size(&self, _group_id: &str) -> ProviderResult<i64> {
        Ok(self.magnum.get_cluster(&self.cluster_id).await?.node_count)
    }

    async fn update_size(&self, _group_id: &str, count: i64) -> ProviderResult<()> {
        self.magnum
            .update_cluster_node_count(&self.cluster_id, count)
            .await
    }

    async fn list_instances(&self, group_id: &str) -> ProviderResult<Vec<Instance>> {
        list_minion_instances(self.heat.as_ref(), group_id, &self.minions).await
    }

    async fn delete_instances(
        &self,
        _group_id: &str,
        nodes: &[NodeRef],
        new_count: i64,
        deadline: Instant,
    ) -> ProviderResult<()> {
        let indices = self.find_stack_indices(nodes).await?;

        let mut parameters = Map::new();
        parameters.insert("minions_to_remove".into(), Value::String(indices.join(",")));
        parameters.insert("number_of_minions".into(), Value::from(new_count));
        info!(
            minions_to_remove = %indices.join(","),
            number_of_minions = new_count,
            "Patching cluster stack"
        );
        self.heat
            .patch_stack_parameters(&self.stack, parameters)
            .await?;

        // The stack must settle before the cluster is told its new size.
        self.wait_for_status(
            "stack",
            status::UPDATE_IN_PROGRESS,
            self.settings.in_progress_timeout,
            deadline,
            || self.stack_status(),
        )
        .await?;
        self.wait_for_status(
            "stack",
            status::UPDATE_COMPLETE,
            self.settings.complete_timeout,
            deadline,
            || self.stack_status(),
        )
        .await?;

        self.magnum
            .update_cluster_node_count(&self.cluster_id, new_count)
            .await
    }

    async fn discover_groups(
        &self,
        _configs: &[AutoDiscoveryConfig],
    ) -> ProviderResult<Vec<DiscoveredGroup>> {
        Err(ProviderError::NotImplemented(
            "node group auto-discovery with the heat adapter",
        ))
    }

    async fn identify(&self, group: &str) -> ProviderResult<(String, String)> {
        Ok((group.to_string(), group.to_string()))
    }

    async fn owner_of(&self, node: &NodeHandle) -> ProviderResult<String> {
        if let Some((group, _)) = parse_fake(&node.provider_id) {
            return Ok(group);
        }
        let group = self.group.read().ok().and_then(|g| g.clone());
        group.ok_or_else(|| {
            ProviderError::NotFound(format!(
                "could not find node group for node {}",
                node.provider_id
            ))
        })
    }

    async fn can_mutate(&self) -> ProviderResult<(bool, String)> {
        let status = self.cluster_status().await?;
        Ok((!status::prevents_update(&status), status))
    }

    async fn wait_for_resize(&self, deadline: Instant) -> ProviderResult<()> {
        self.wait_for_status(
            "cluster",
            status::UPDATE_IN_PROGRESS,
            self.settings.in_progress_timeout,
            deadline,
            || self.cluster_status(),
        )
        .await?;
        self.wait_for_status(
            "cluster",
            status::UPDATE_COMPLETE,
            self.settings.complete_timeout,
            deadline,
            || self.cluster_status(),
        )
        .await
    }

    async fn prepare_group(&self, group_id: &str) -> ProviderResult<()> {
        if let Ok(mut group) = self.group.write() {
            *group = Some(group_id.to_string());
        }
        Ok(())
    }

    fn forget_group(&self, group_id: &str) {
        if let Ok(mut group) = self.group.write() {
            if group.as_deref() == Some(group_id) {
                *group = None;
            }
        }
    }

    async fn template_node_info(&self, _group: &DiscoveredGroup) -> ProviderResult<NodeTemplate> {
        Err(ProviderError::NotImplemented(
            "node templates with the heat adapter",
        ))
    }
}
