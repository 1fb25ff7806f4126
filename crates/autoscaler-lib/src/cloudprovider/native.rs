//! Native multi-group adapter
//!
//! Node groups are first-class objects of the cluster. Grow and targeted
//! shrink are a single resize call; instance state is reconstructed from each
//! group's nested kube-minions stack.

use super::api::{
    ComputeApi, ContainerInfraApi, OrchestrationApi, ResizeRequest, StackRef,
    KUBE_MINIONS_RESOURCE, MASTER_ROLE,
};
use super::discovery::AutoDiscoveryConfig;
use super::minions::list_minion_instances;
use super::provider_id::{canonical_uuid, format_openstack, parse_fake, parse_openstack};
use super::ProviderAdapter;
use crate::error::{ProviderError, ProviderResult};
use crate::models::{
    unique_id, DiscoveredGroup, Instance, NodeHandle, NodeRef, NodeTemplate,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Label carrying the owning node group name on template nodes
pub const NODEGROUP_LABEL: &str = "magnum.openstack.org/nodegroup";

const FALLBACK_CPU_CORES: u32 = 4;
const FALLBACK_RAM_MB: u64 = 4096;
const FALLBACK_DISK_GB: u64 = 50;

/// The orchestration objects behind one node group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTriple {
    pub stack: StackRef,
    pub minions: StackRef,
}

impl StackTriple {
    fn is_complete(&self) -> bool {
        !self.stack.name.is_empty()
            && !self.stack.id.is_empty()
            && !self.minions.name.is_empty()
            && !self.minions.id.is_empty()
    }
}

pub struct NativeAdapter {
    cluster_id: String,
    magnum: Arc<dyn ContainerInfraApi>,
    heat: Arc<dyn OrchestrationApi>,
    compute: Arc<dyn ComputeApi>,
    /// Stack triples, written once per group
    stacks: DashMap<String, StackTriple>,
    /// Provider id -> stable group id
    owners: DashMap<String, String>,
}

impl NativeAdapter {
    /// Resolves the cluster name to its id and builds the adapter.
    pub async fn connect(
        cluster: &str,
        magnum: Arc<dyn ContainerInfraApi>,
        heat: Arc<dyn OrchestrationApi>,
        compute: Arc<dyn ComputeApi>,
    ) -> ProviderResult<Self> {
        let found = magnum.get_cluster(cluster).await?;
        if found.uuid != cluster {
            info!(cluster_name = %cluster, cluster_id = %found.uuid, "Using cluster UUID instead of name");
        }
        Ok(Self {
            cluster_id: found.uuid,
            magnum,
            heat,
            compute,
            stacks: DashMap::new(),
            owners: DashMap::new(),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Returns the cached stack triple of a group, fetching it on first use.
    pub async fn stack_triple(&self, group_id: &str) -> ProviderResult<StackTriple> {
        if let Some(triple) = self.stacks.get(group_id) {
            trace!(node_group = %group_id, "Stack triple cache hit");
            return Ok(triple.clone());
        }

        let group = self.magnum.get_node_group(&self.cluster_id, group_id).await?;
        let stack = self.heat.find_stack(&group.stack_id).await?;
        let stack = StackRef {
            name: stack.name,
            id: group.stack_id,
        };

        let minions_resource = self
            .heat
            .get_stack_resource(&stack, KUBE_MINIONS_RESOURCE)
            .await?;
        let minions_stack = self.heat.find_stack(&minions_resource.physical_id).await?;
        let triple = StackTriple {
            stack,
            minions: StackRef {
                name: minions_stack.name,
                id: minions_resource.physical_id,
            },
        };

        if !triple.is_complete() {
            return Err(ProviderError::Unavailable(format!(
                "incomplete stack information for node group {}",
                group_id
            )));
        }

        debug!(
            node_group = %group_id,
            stack = %triple.stack.name,
            minions_stack = %triple.minions.name,
            "Cached node group stacks"
        );
        self.stacks.insert(group_id.to_string(), triple.clone());
        Ok(triple)
    }

    pub fn has_stack_triple(&self, group_id: &str) -> bool {
        self.stacks.contains_key(group_id)
    }

    pub fn cached_owner(&self, provider_id: &str) -> Option<String> {
        self.owners.get(provider_id).map(|g| g.clone())
    }

    /// Removal token for one node: the minion index for synthetic ids,
    /// otherwise the server id.
    fn removal_token(node: &NodeRef) -> ProviderResult<String> {
        if let Some((_, index)) = parse_fake(&node.provider_id) {
            return Ok(index);
        }
        if !node.machine_id.is_empty() {
            return Ok(canonical_uuid(&node.machine_id).unwrap_or_else(|| node.machine_id.clone()));
        }
        parse_openstack(&node.provider_id)
            .map(|id| id.hyphenated().to_string())
            .ok_or_else(|| {
                ProviderError::Resolution(format!("node {} has no usable identifier", node.name))
            })
    }
}

#[async_trait]
impl ProviderAdapter for NativeAdapter {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn size(&self, group_id: &str) -> ProviderResult<i64> {
        let group = self.magnum.get_node_group(&self.cluster_id, group_id).await?;
        Ok(group.node_count)
    }

    async fn update_size(&self, group_id: &str, count: i64) -> ProviderResult<()> {
        let request = ResizeRequest {
            node_count: count,
            nodes_to_remove: Vec::new(),
            nodegroup: group_id.to_string(),
        };
        self.magnum.resize_cluster(&self.cluster_id, &request).await
    }

    async fn list_instances(&self, group_id: &str) -> ProviderResult<Vec<Instance>> {
        let triple = self.stack_triple(group_id).await?;
        let instances = list_minion_instances(self.heat.as_ref(), group_id, &triple.minions).await?;

        for instance in &instances {
            if parse_openstack(&instance.id).is_some() {
                self.owners.insert(instance.id.clone(), group_id.to_string());
            }
        }
        Ok(instances)
    }

    async fn delete_instances(
        &self,
        group_id: &str,
        nodes: &[NodeRef],
        new_count: i64,
        _deadline: Instant,
    ) -> ProviderResult<()> {
        let nodes_to_remove = nodes
            .iter()
            .map(Self::removal_token)
            .collect::<ProviderResult<Vec<_>>>()?;

        info!(
            node_group = %group_id,
            node_count = new_count,
            remove = ?nodes_to_remove,
            "Resizing node group"
        );

        let request = ResizeRequest {
            node_count: new_count,
            nodes_to_remove,
            nodegroup: group_id.to_string(),
        };
        self.magnum.resize_cluster(&self.cluster_id, &request).await
    }

    async fn discover_groups(
        &self,
        configs: &[AutoDiscoveryConfig],
    ) -> ProviderResult<Vec<DiscoveredGroup>> {
        let groups = self.magnum.list_node_groups(&self.cluster_id).await?;
        let mut discovered = Vec::new();

        for group in groups {
            if group.role == MASTER_ROLE {
                continue;
            }

            // The listing omits min/max counts.
            let detail = self
                .magnum
                .get_node_group(&self.cluster_id, &group.uuid)
                .await?;

            let Some(max_size) = detail.max_node_count else {
                debug!(node_group = %detail.name, "Node group does not have max node count set");
                continue;
            };

            if !configs.iter().any(|cfg| cfg.matches(&detail.role)) {
                debug!(
                    node_group = %detail.name,
                    role = %detail.role,
                    "Node group does not match any auto discovery config"
                );
                continue;
            }

            discovered.push(DiscoveredGroup {
                id: detail.uuid,
                name: detail.name,
                role: detail.role,
                node_count: detail.node_count,
                min_size: detail.min_node_count,
                max_size,
                flavor_id: detail.flavor_id,
                labels: detail.labels,
            });
        }

        Ok(discovered)
    }

    async fn identify(&self, group: &str) -> ProviderResult<(String, String)> {
        let detail = self.magnum.get_node_group(&self.cluster_id, group).await?;
        Ok((unique_id(&detail.name, &detail.uuid), detail.uuid))
    }

    async fn owner_of(&self, node: &NodeHandle) -> ProviderResult<String> {
        // Compare against the canonical form the cache is filled with.
        let provider_id = parse_openstack(&node.provider_id)
            .map(|id| format_openstack(&id))
            .unwrap_or_else(|| node.provider_id.clone());

        if let Some(group) = self.cached_owner(&provider_id) {
            trace!(provider_id = %provider_id, node_group = %group, "Owner cache hit");
            return Ok(group);
        }

        if let Some((group, _)) = parse_fake(&provider_id) {
            return Ok(group);
        }

        let mut groups = self.magnum.list_node_groups(&self.cluster_id).await?;
        groups.retain(|g| g.role != MASTER_ROLE);
        // Larger groups are more likely to hold the node.
        groups.sort_by(|a, b| b.node_count.cmp(&a.node_count));

        for group in groups {
            trace!(node_group = %group.uuid, size = group.node_count, "Checking node group");
            let triple = self.stack_triple(&group.uuid).await?;
            let stack = self.heat.get_stack(&triple.minions).await?;
            let refs = stack.refs_map().ok_or_else(|| {
                ProviderError::Unavailable("could not check the minions stack refs_map".into())
            })?;

            // Cache the whole map before deciding, so later lookups hit.
            let mut found = false;
            for value in refs.values() {
                let Ok(server) = Uuid::parse_str(value) else {
                    continue;
                };
                let id = format_openstack(&server);
                if id == provider_id {
                    found = true;
                }
                self.owners.insert(id, group.uuid.clone());
            }

            if found {
                debug!(provider_id = %provider_id, node_group = %group.uuid, "Found node group for node");
                return Ok(group.uuid);
            }
        }

        Err(ProviderError::NotFound(format!(
            "could not find node group for node {}",
            node.provider_id
        )))
    }

    async fn can_mutate(&self) -> ProviderResult<(bool, String)> {
        // Resizes are scoped to a single group and accepted in any cluster state.
        Ok((true, String::new()))
    }

    async fn prepare_group(&self, group_id: &str) -> ProviderResult<()> {
        self.stack_triple(group_id).await.map(|_| ())
    }

    fn forget_group(&self, group_id: &str) {
        self.stacks.remove(group_id);
        self.owners.retain(|_, owner| owner != group_id);
    }

    async fn template_node_info(&self, group: &DiscoveredGroup) -> ProviderResult<NodeTemplate> {
        let mut labels = group.labels.clone();
        labels.insert(NODEGROUP_LABEL.to_string(), group.name.clone());

        let template = match self.compute.get_flavor(&group.flavor_id).await {
            Ok(flavor) => NodeTemplate {
                cpu_cores: flavor.vcpus,
                ram_megabytes: flavor.ram,
                disk_gigabytes: flavor.disk,
                labels,
            },
            Err(e) => {
                warn!(
                    node_group = %group.name,
                    flavor = %group.flavor_id,
                    error = %e,
                    "Failed to read flavor, using a default template"
                );
                NodeTemplate {
                    cpu_cores: FALLBACK_CPU_CORES,
                    ram_megabytes: FALLBACK_RAM_MB,
                    disk_gigabytes: FALLBACK_DISK_GB,
                    labels,
                }
            }
        };
        Ok(template)
    }
}
