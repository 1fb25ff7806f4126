//! Vertical scaler objects

use super::aggregate::AggregateContainerState;
use super::recommendation::{RecommendedContainerResources, Resources};
use super::{AggregateKey, Labels};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VpaId {
    pub namespace: String,
    pub name: String,
}

impl VpaId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VpaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    Off,
    Initial,
    Recreate,
    #[default]
    Auto,
}

/// Per-container resource policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerPolicy {
    /// No recommendation is produced for the container
    #[serde(default)]
    pub disabled: bool,
    pub min_allowed: Option<Resources>,
    pub max_allowed: Option<Resources>,
}

/// A vertical scaler as declared in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpaSpec {
    pub id: VpaId,
    /// Pods in the same namespace carrying all of these labels are selected.
    pub selector: Labels,
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default)]
    pub container_policies: HashMap<String, ContainerPolicy>,
    pub created: DateTime<Utc>,
}

/// Model-side state of a vertical scaler
#[derive(Debug, Clone)]
pub struct Vpa {
    pub id: VpaId,
    pub selector: Labels,
    pub update_mode: UpdateMode,
    pub container_policies: HashMap<String, ContainerPolicy>,
    pub created: DateTime<Utc>,
    /// Number of tracked pods the selector matches
    pub pod_count: usize,
    pub recommendation: Option<BTreeMap<String, RecommendedContainerResources>>,
    /// State loaded from checkpoints, keyed by container name
    pub initial_states: HashMap<String, AggregateContainerState>,
    pub checkpoint_written: Option<DateTime<Utc>>,
}

impl Vpa {
    pub fn new(spec: &VpaSpec) -> Self {
        Self {
            id: spec.id.clone(),
            selector: spec.selector.clone(),
            update_mode: spec.update_mode,
            container_policies: spec.container_policies.clone(),
            created: spec.created,
            pod_count: 0,
            recommendation: None,
            initial_states: HashMap::new(),
            checkpoint_written: None,
        }
    }

    /// An empty selector matches no pod.
    pub fn matches_pod(&self, namespace: &str, labels: &Labels) -> bool {
        namespace == self.id.namespace
            && !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn matches_key(&self, key: &AggregateKey) -> bool {
        self.matches_pod(&key.namespace, &key.labels)
    }

    pub fn policy(&self, container: &str) -> Option<&ContainerPolicy> {
        self.container_policies.get(container)
    }

    pub fn is_disabled(&self, container: &str) -> bool {
        self.policy(container).map_or(false, |p| p.disabled)
    }

    /// Applies the mutable parts of a spec with an unchanged selector.
    pub fn update_from_spec(&mut self, spec: &VpaSpec) {
        self.update_mode = spec.update_mode;
        self.container_policies = spec.container_policies.clone();
    }

    /// Adopts a checkpointed aggregate as initial state for a container.
    pub fn merge_checkpointed_state(&mut self, container: &str, state: AggregateContainerState) {
        match self.initial_states.get_mut(container) {
            Some(existing) => existing.merge(&state),
            None => {
                self.initial_states.insert(container.to_string(), state);
            }
        }
    }
}
