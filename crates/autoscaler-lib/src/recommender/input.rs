//! Feeds cluster objects, usage metrics and OOM events into the model

use super::checkpoint::CheckpointWriter;
use super::cluster::ClusterState;
use super::config::RecommenderConfig;
use super::recommendation::{RecommendedContainerResources, Resources};
use super::vpa::{VpaId, VpaSpec};
use super::{ContainerId, Labels, PodId, PodPhase, UsageSample};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub request: Resources,
}

/// A pod as listed from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: PodId,
    pub labels: Labels,
    pub phase: PodPhase,
    pub containers: Vec<ContainerSpec>,
}

/// Usage of one container over a measurement window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub container: ContainerId,
    pub snapshot_time: DateTime<Utc>,
    pub cpu_cores: f64,
    pub memory_bytes: f64,
}

/// An out-of-memory kill reported by the OOM observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OomEvent {
    pub container: ContainerId,
    pub timestamp: DateTime<Utc>,
    /// Memory request of the container when it was killed, in bytes
    pub requested_memory: f64,
}

/// Channel the OOM observer pushes into and the feeder drains.
pub fn oom_channel(capacity: usize) -> (mpsc::Sender<OomEvent>, mpsc::Receiver<OomEvent>) {
    mpsc::channel(capacity)
}

/// Source of vertical scalers and pods
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list_vpas(&self) -> Result<Vec<VpaSpec>>;

    async fn list_pods(&self) -> Result<Vec<PodSpec>>;

    /// Publishes a computed recommendation. Sources without a write path
    /// drop it.
    async fn publish_recommendation(
        &self,
        _vpa: &VpaId,
        _recommendation: &BTreeMap<String, RecommendedContainerResources>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Source of real-time container usage
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn container_metrics(&self) -> Result<Vec<ContainerMetrics>>;
}

/// Counts from one metrics load
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedSummary {
    pub accepted: usize,
    /// Samples for containers the model does not track
    pub untracked: usize,
    pub discarded: usize,
}

pub struct ClusterFeeder {
    source: std::sync::Arc<dyn ClusterSource>,
    metrics: std::sync::Arc<dyn MetricsSource>,
    oom_events: mpsc::Receiver<OomEvent>,
    checkpoints: CheckpointWriter,
    config: RecommenderConfig,
}

impl ClusterFeeder {
    pub fn new(
        source: std::sync::Arc<dyn ClusterSource>,
        metrics: std::sync::Arc<dyn MetricsSource>,
        oom_events: mpsc::Receiver<OomEvent>,
        checkpoints: CheckpointWriter,
        config: RecommenderConfig,
    ) -> Self {
        Self {
            source,
            metrics,
            oom_events,
            checkpoints,
            config,
        }
    }

    pub fn source(&self) -> &std::sync::Arc<dyn ClusterSource> {
        &self.source
    }

    pub fn checkpoints(&self) -> &CheckpointWriter {
        &self.checkpoints
    }

    fn checkpoint_namespace(&self) -> Option<&str> {
        self.config.vpa_object_namespace.as_deref()
    }

    /// Loads scalers and then adopts their checkpoints. Store failures are
    /// logged and the model starts empty.
    pub async fn init_from_checkpoints(&self, cluster: &mut ClusterState) -> Result<usize> {
        self.load_vpas(cluster).await?;
        match self
            .checkpoints
            .load_into(cluster, self.checkpoint_namespace(), Utc::now())
            .await
        {
            Ok(loaded) => {
                info!(loaded, "Initialized recommender from checkpoints");
                Ok(loaded)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read checkpoints, starting from empty state");
                Ok(0)
            }
        }
    }

    /// Syncs the scalers in scope. Scalers gone from the source are removed.
    pub async fn load_vpas(&self, cluster: &mut ClusterState) -> Result<usize> {
        let specs = self.source.list_vpas().await?;
        let mut seen = HashSet::new();
        for spec in specs
            .iter()
            .filter(|spec| self.config.namespace_in_scope(&spec.id.namespace))
        {
            cluster.add_or_update_vpa(spec);
            seen.insert(spec.id.clone());
        }

        for id in cluster.vpa_ids() {
            if !seen.contains(&id) {
                debug!(vpa = %id, "Removing deleted vertical scaler");
                if let Err(e) = cluster.delete_vpa(&id) {
                    debug!(vpa = %id, error = %e, "Vertical scaler already removed");
                }
            }
        }
        Ok(seen.len())
    }

    /// Syncs the pods in scope. In memory-saver mode only pods selected by
    /// a scaler are tracked.
    pub async fn load_pods(&self, cluster: &mut ClusterState) -> Result<usize> {
        let pods = self.source.list_pods().await?;
        let mut seen = HashSet::new();
        for pod in pods {
            if !self.config.namespace_in_scope(&pod.id.namespace) {
                continue;
            }
            if self.config.memory_saver
                && !cluster
                    .vpas()
                    .any(|vpa| vpa.matches_pod(&pod.id.namespace, &pod.labels))
            {
                continue;
            }

            cluster.add_or_update_pod(pod.id.clone(), pod.labels.clone(), pod.phase);
            for container in &pod.containers {
                let id = ContainerId::new(pod.id.clone(), &container.name);
                cluster.add_or_update_container(&id, container.request)?;
            }
            seen.insert(pod.id);
        }

        for id in cluster.pod_ids() {
            if !seen.contains(&id) {
                cluster.delete_pod(&id);
            }
        }
        Ok(seen.len())
    }

    /// Adds one CPU and one memory sample per container snapshot.
    pub async fn load_metrics(&self, cluster: &mut ClusterState) -> Result<FeedSummary> {
        let snapshots = self.metrics.container_metrics().await?;
        let mut summary = FeedSummary::default();
        for snapshot in snapshots {
            let samples = [
                UsageSample::cpu(snapshot.snapshot_time, snapshot.cpu_cores, 0.0),
                UsageSample::memory(snapshot.snapshot_time, snapshot.memory_bytes),
            ];
            for sample in &samples {
                match cluster.add_sample(&snapshot.container, sample) {
                    Ok(()) => summary.accepted += 1,
                    Err(e) if e.is_key_error() => summary.untracked += 1,
                    Err(e) => {
                        debug!(container = %snapshot.container, error = %e, "Discarded sample");
                        summary.discarded += 1;
                    }
                }
            }
        }
        debug!(
            accepted = summary.accepted,
            untracked = summary.untracked,
            discarded = summary.discarded,
            "Loaded container metrics"
        );
        Ok(summary)
    }

    /// Applies every OOM event queued so far without waiting for more.
    pub fn drain_oom_events(&mut self, cluster: &mut ClusterState) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.oom_events.try_recv() {
            match cluster.record_oom(&event.container, event.timestamp, event.requested_memory) {
                Ok(()) => {
                    info!(container = %event.container, requested = event.requested_memory, "Recorded OOM");
                    applied += 1;
                }
                Err(e) => debug!(container = %event.container, error = %e, "Dropped OOM event"),
            }
        }
        applied
    }

    /// Deletes checkpoints of scalers that no longer exist in the source.
    pub async fn garbage_collect_checkpoints(&self) -> Result<usize> {
        let live: HashSet<VpaId> = self
            .source
            .list_vpas()
            .await?
            .into_iter()
            .map(|spec| spec.id)
            .collect();
        Ok(self
            .checkpoints
            .garbage_collect(&live, self.checkpoint_namespace())
            .await?)
    }
}
