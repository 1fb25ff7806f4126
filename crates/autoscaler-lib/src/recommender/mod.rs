//! Vertical resource recommender
//!
//! This module provides:
//! - Decaying usage histograms and per-container aggregate state
//! - The in-memory cluster model of pods, vertical scalers and aggregates
//! - Recommendation computation from aggregated usage
//! - Checkpoint persistence and garbage collection
//! - The feeder that pulls cluster state, metrics and OOM events into the model
//! - A file-backed snapshot source for running outside the orchestrator

pub mod aggregate;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod histogram;
pub mod input;
pub mod recommendation;
pub mod routine;
pub mod snapshot;
pub mod vpa;

pub use aggregate::{AggregateCheckpoint, AggregateContainerState, AggregationSettings};
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use cluster::ClusterState;
pub use config::RecommenderConfig;
pub use histogram::{DecayingHistogram, HistogramCheckpoint, HistogramOptions};
pub use input::{ClusterFeeder, ClusterSource, MetricsSource, OomEvent};
pub use recommendation::{RecommendedContainerResources, Resources, ResourceRecommender};
pub use routine::RecommenderRoutine;
pub use snapshot::{ClusterSnapshot, SnapshotSource};
pub use vpa::{ContainerPolicy, UpdateMode, Vpa, VpaSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pod labels, kept sorted so equal sets compare and print equally
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId {
    pub pod: PodId,
    pub container: String,
}

impl ContainerId {
    pub fn new(pod: PodId, container: impl Into<String>) -> Self {
        Self {
            pod,
            container: container.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod, self.container)
    }
}

/// Identifies the set of containers whose samples share one aggregate:
/// same namespace, same container name and same pod labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub namespace: String,
    pub container: String,
    pub labels: Labels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

/// One usage observation. CPU is in cores, memory in bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub measure_start: DateTime<Utc>,
    pub resource: ResourceKind,
    pub usage: f64,
    /// CPU request at sampling time, used as the sample weight
    pub request: f64,
}

impl UsageSample {
    pub fn cpu(measure_start: DateTime<Utc>, usage_cores: f64, request_cores: f64) -> Self {
        Self {
            measure_start,
            resource: ResourceKind::Cpu,
            usage: usage_cores,
            request: request_cores,
        }
    }

    pub fn memory(measure_start: DateTime<Utc>, usage_bytes: f64) -> Self {
        Self {
            measure_start,
            resource: ResourceKind::Memory,
            usage: usage_bytes,
            request: 0.0,
        }
    }
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Pods that finished no longer contribute samples.
    pub fn is_active(&self) -> bool {
        !matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}
