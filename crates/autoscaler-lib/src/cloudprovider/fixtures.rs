//! In-memory cloud used by the adapter and engine tests

use super::api::{
    Cluster, ComputeApi, ContainerInfraApi, Flavor, NodeGroupDetail, OrchestrationApi,
    ResizeRequest, Stack, StackOutput, StackRef, StackResource, KUBE_MINIONS_RESOURCE,
    REFS_MAP_OUTPUT,
};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const CLUSTER_ID: &str = "f2a1c58e-0d38-4f9b-9a6c-6e5a0c1b2d3e";
pub const CLUSTER_NAME: &str = "test-cluster";
pub const CLUSTER_STACK_ID: &str = "c0ffee00-0000-4000-8000-000000000001";
pub const CLUSTER_MINIONS_STACK_ID: &str = "c0ffee00-0000-4000-8000-000000000002";

#[derive(Default)]
struct FakeState {
    clusters: Vec<Cluster>,
    node_groups: Vec<NodeGroupDetail>,
    stacks: HashMap<String, Stack>,
    resources: HashMap<String, Vec<StackResource>>,
    flavors: HashMap<String, Flavor>,
    stack_status_script: HashMap<String, VecDeque<String>>,
    cluster_status_script: VecDeque<String>,
    failures: HashMap<&'static str, ProviderError>,
    resizes: Vec<ResizeRequest>,
    node_count_updates: Vec<i64>,
    stack_patches: Vec<(StackRef, Map<String, Value>)>,
}

/// Fake implementation of the three cloud API traits.
///
/// Every call is recorded by method name so tests can assert on the exact
/// set of remote calls an operation made.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        let cloud = Self::default();
        cloud.state.lock().unwrap().clusters.push(Cluster {
            uuid: CLUSTER_ID.into(),
            name: CLUSTER_NAME.into(),
            status: "CREATE_COMPLETE".into(),
            status_reason: None,
            node_count: 0,
            stack_id: CLUSTER_STACK_ID.into(),
        });
        cloud
    }

    fn record(&self, method: &'static str) -> ProviderResult<()> {
        self.calls.lock().unwrap().push(method);
        match self.state.lock().unwrap().failures.get(method) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| **m == method).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail(&self, method: &'static str, err: ProviderError) {
        self.state.lock().unwrap().failures.insert(method, err);
    }

    pub fn resizes(&self) -> Vec<ResizeRequest> {
        self.state.lock().unwrap().resizes.clone()
    }

    pub fn node_count_updates(&self) -> Vec<i64> {
        self.state.lock().unwrap().node_count_updates.clone()
    }

    pub fn stack_patches(&self) -> Vec<(StackRef, Map<String, Value>)> {
        self.state.lock().unwrap().stack_patches.clone()
    }

    pub fn set_cluster(&self, f: impl FnOnce(&mut Cluster)) {
        let mut state = self.state.lock().unwrap();
        if let Some(cluster) = state.clusters.first_mut() {
            f(cluster);
        }
    }

    /// Successive `get_cluster` calls report these statuses. The last one sticks.
    pub fn script_cluster_status(&self, statuses: &[&str]) {
        self.state.lock().unwrap().cluster_status_script =
            statuses.iter().map(|s| s.to_string()).collect();
    }

    /// Successive `get_stack` calls on `stack_id` report these statuses.
    pub fn script_stack_status(&self, stack_id: &str, statuses: &[&str]) {
        self.state.lock().unwrap().stack_status_script.insert(
            stack_id.to_string(),
            statuses.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn add_flavor(&self, flavor: Flavor) {
        self.state
            .lock()
            .unwrap()
            .flavors
            .insert(flavor.id.clone(), flavor);
    }

    pub fn add_stack(&self, id: &str, name: &str, refs: Option<&[(&str, &str)]>) {
        let outputs = refs
            .map(|entries| {
                let map: Map<String, Value> = entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                    .collect();
                vec![StackOutput {
                    output_key: REFS_MAP_OUTPUT.into(),
                    output_value: Value::Object(map),
                }]
            })
            .unwrap_or_default();
        self.state.lock().unwrap().stacks.insert(
            id.to_string(),
            Stack {
                id: id.to_string(),
                name: name.to_string(),
                status: "CREATE_COMPLETE".into(),
                status_reason: None,
                outputs,
            },
        );
    }

    pub fn set_resources(&self, stack_id: &str, resources: Vec<StackResource>) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(stack_id.to_string(), resources);
    }

    /// Sets up the cluster stack with its nested kube-minions stack.
    pub fn add_cluster_stacks(&self, refs: &[(&str, &str)]) {
        self.add_stack(CLUSTER_STACK_ID, "test-cluster-abcd", None);
        self.set_resources(
            CLUSTER_STACK_ID,
            vec![StackResource {
                name: KUBE_MINIONS_RESOURCE.into(),
                physical_id: CLUSTER_MINIONS_STACK_ID.into(),
                status: "CREATE_COMPLETE".into(),
                ..Default::default()
            }],
        );
        self.add_stack(
            CLUSTER_MINIONS_STACK_ID,
            "test-cluster-abcd-kube_minions-xyz",
            Some(refs),
        );
    }

    /// Adds a node group together with its stack, kube-minions resource and
    /// minions stack. Returns the minions stack id.
    pub fn add_node_group(
        &self,
        detail: NodeGroupDetail,
        minions: Vec<StackResource>,
        refs: &[(&str, &str)],
    ) -> String {
        let stack_id = format!("stack-{}", detail.uuid);
        let minions_id = format!("minions-{}", detail.uuid);
        let mut detail = detail;
        detail.stack_id = stack_id.clone();

        self.add_stack(&stack_id, &format!("{}-stack", detail.name), None);
        self.set_resources(
            &stack_id,
            vec![StackResource {
                name: KUBE_MINIONS_RESOURCE.into(),
                physical_id: minions_id.clone(),
                status: "CREATE_COMPLETE".into(),
                ..Default::default()
            }],
        );
        self.add_stack(
            &minions_id,
            &format!("{}-kube_minions", detail.name),
            Some(refs),
        );
        self.set_resources(&minions_id, minions);
        self.state.lock().unwrap().node_groups.push(detail);
        minions_id
    }

    pub fn remove_node_group(&self, uuid: &str) {
        self.state
            .lock()
            .unwrap()
            .node_groups
            .retain(|ng| ng.uuid != uuid);
    }

    pub fn update_node_group(&self, uuid: &str, f: impl FnOnce(&mut NodeGroupDetail)) {
        let mut state = self.state.lock().unwrap();
        if let Some(ng) = state.node_groups.iter_mut().find(|ng| ng.uuid == uuid) {
            f(ng);
        }
    }

    fn find_cluster(state: &FakeState, cluster: &str) -> ProviderResult<Cluster> {
        state
            .clusters
            .iter()
            .find(|c| c.uuid == cluster || c.name == cluster)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("cluster {}", cluster)))
    }
}

pub fn node_group(uuid: &str, name: &str, role: &str, count: i64, min: i64, max: Option<i64>) -> NodeGroupDetail {
    NodeGroupDetail {
        uuid: uuid.into(),
        name: name.into(),
        role: role.into(),
        node_count: count,
        min_node_count: min,
        max_node_count: max,
        flavor_id: "m1.medium".into(),
        ..Default::default()
    }
}

pub fn minion(index: &str, status: &str) -> StackResource {
    StackResource {
        name: index.into(),
        physical_id: format!("minion-{}", index),
        status: status.into(),
        resource_type: "file:///kubeminion.yaml".into(),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerInfraApi for FakeCloud {
    async fn get_cluster(&self, cluster: &str) -> ProviderResult<Cluster> {
        self.record("get_cluster")?;
        let mut state = self.state.lock().unwrap();
        let mut found = Self::find_cluster(&state, cluster)?;
        if state.cluster_status_script.len() > 1 {
            if let Some(status) = state.cluster_status_script.pop_front() {
                found.status = status;
            }
        } else if let Some(status) = state.cluster_status_script.front() {
            found.status = status.clone();
        }
        Ok(found)
    }

    async fn update_cluster_node_count(&self, cluster: &str, count: i64) -> ProviderResult<()> {
        self.record("update_cluster_node_count")?;
        let mut state = self.state.lock().unwrap();
        Self::find_cluster(&state, cluster)?;
        state.node_count_updates.push(count);
        if let Some(c) = state.clusters.first_mut() {
            c.node_count = count;
        }
        Ok(())
    }

    async fn resize_cluster(&self, cluster: &str, request: &ResizeRequest) -> ProviderResult<()> {
        self.record("resize_cluster")?;
        let mut state = self.state.lock().unwrap();
        Self::find_cluster(&state, cluster)?;
        state.resizes.push(request.clone());
        if let Some(ng) = state
            .node_groups
            .iter_mut()
            .find(|ng| ng.uuid == request.nodegroup)
        {
            ng.node_count = request.node_count;
        }
        Ok(())
    }

    async fn list_node_groups(&self, cluster: &str) -> ProviderResult<Vec<NodeGroupDetail>> {
        self.record("list_node_groups")?;
        let state = self.state.lock().unwrap();
        Self::find_cluster(&state, cluster)?;
        // The listing never carries min/max counts.
        Ok(state
            .node_groups
            .iter()
            .map(|ng| NodeGroupDetail {
                max_node_count: None,
                min_node_count: 0,
                ..ng.clone()
            })
            .collect())
    }

    async fn get_node_group(
        &self,
        cluster: &str,
        node_group: &str,
    ) -> ProviderResult<NodeGroupDetail> {
        self.record("get_node_group")?;
        let state = self.state.lock().unwrap();
        Self::find_cluster(&state, cluster)?;
        state
            .node_groups
            .iter()
            .find(|ng| ng.uuid == node_group || ng.name == node_group)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("node group {}", node_group)))
    }
}

#[async_trait]
impl OrchestrationApi for FakeCloud {
    async fn find_stack(&self, name_or_id: &str) -> ProviderResult<Stack> {
        self.record("find_stack")?;
        let state = self.state.lock().unwrap();
        state
            .stacks
            .values()
            .find(|s| s.id == name_or_id || s.name == name_or_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("stack {}", name_or_id)))
    }

    async fn get_stack(&self, stack: &StackRef) -> ProviderResult<Stack> {
        self.record("get_stack")?;
        let mut state = self.state.lock().unwrap();
        let mut found = state
            .stacks
            .get(&stack.id)
            .filter(|s| s.name == stack.name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("stack {}/{}", stack.name, stack.id)))?;
        if let Some(script) = state.stack_status_script.get_mut(&stack.id) {
            if script.len() > 1 {
                if let Some(status) = script.pop_front() {
                    found.status = status;
                }
            } else if let Some(status) = script.front() {
                found.status = status.clone();
            }
        }
        Ok(found)
    }

    async fn get_stack_resource(
        &self,
        stack: &StackRef,
        resource: &str,
    ) -> ProviderResult<StackResource> {
        self.record("get_stack_resource")?;
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(&stack.id)
            .and_then(|rs| rs.iter().find(|r| r.name == resource))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("resource {}", resource)))
    }

    async fn list_stack_resources(&self, stack: &StackRef) -> ProviderResult<Vec<StackResource>> {
        self.record("list_stack_resources")?;
        let state = self.state.lock().unwrap();
        Ok(state.resources.get(&stack.id).cloned().unwrap_or_default())
    }

    async fn find_stack_resources(&self, stack_id: &str) -> ProviderResult<Vec<StackResource>> {
        self.record("find_stack_resources")?;
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(stack_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("stack {}", stack_id)))
    }

    async fn patch_stack_parameters(
        &self,
        stack: &StackRef,
        parameters: Map<String, Value>,
    ) -> ProviderResult<()> {
        self.record("patch_stack_parameters")?;
        self.state
            .lock()
            .unwrap()
            .stack_patches
            .push((stack.clone(), parameters));
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn get_flavor(&self, flavor_id: &str) -> ProviderResult<Flavor> {
        self.record("get_flavor")?;
        let state = self.state.lock().unwrap();
        state
            .flavors
            .get(flavor_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("flavor {}", flavor_id)))
    }
}
