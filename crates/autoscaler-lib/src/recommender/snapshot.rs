//! File-backed cluster and metrics source
//!
//! An exporter running beside the autoscaler keeps a JSON snapshot of the
//! vertical scalers, pods, latest container usage and recent OOM kills.
//! Recommendations are written back as one JSON file per scaler.

use super::input::{ClusterSource, ContainerMetrics, MetricsSource, OomEvent, PodSpec};
use super::recommendation::RecommendedContainerResources;
use super::vpa::{VpaId, VpaSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub vpas: Vec<VpaSpec>,
    #[serde(default)]
    pub pods: Vec<PodSpec>,
    #[serde(default)]
    pub metrics: Vec<ContainerMetrics>,
    #[serde(default)]
    pub oom_events: Vec<OomEvent>,
}

#[derive(Debug, Serialize)]
struct PublishedRecommendation<'a> {
    namespace: &'a str,
    name: &'a str,
    containers: &'a BTreeMap<String, RecommendedContainerResources>,
}

pub struct SnapshotSource {
    snapshot: PathBuf,
    output_dir: Option<PathBuf>,
    oom_events: Option<mpsc::Sender<OomEvent>>,
    /// Timestamp of the newest OOM event forwarded so far
    oom_forwarded: Mutex<Option<DateTime<Utc>>>,
}

impl SnapshotSource {
    pub fn new(snapshot: impl Into<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        Self {
            snapshot: snapshot.into(),
            output_dir,
            oom_events: None,
            oom_forwarded: Mutex::new(None),
        }
    }

    /// Forwards OOM kills found in the snapshot to `sender` when metrics are
    /// loaded. Each kill is forwarded once, even though the exporter keeps
    /// listing it.
    pub fn with_oom_events(mut self, sender: mpsc::Sender<OomEvent>) -> Self {
        self.oom_events = Some(sender);
        self
    }

    fn forward_oom_events(&self, mut events: Vec<OomEvent>) {
        let Some(sender) = &self.oom_events else {
            return;
        };
        let Ok(mut forwarded) = self.oom_forwarded.lock() else {
            return;
        };

        let newest = *forwarded;
        events.retain(|event| newest.map_or(true, |newest| event.timestamp > newest));
        events.sort_by_key(|event| event.timestamp);
        for event in events {
            let timestamp = event.timestamp;
            if let Err(e) = sender.try_send(event) {
                warn!(error = %e, "Failed to queue OOM event, retrying on next load");
                break;
            }
            *forwarded = Some(timestamp);
        }
    }

    async fn read(&self) -> Result<ClusterSnapshot> {
        let data = tokio::fs::read(&self.snapshot)
            .await
            .with_context(|| format!("Failed to read snapshot {:?}", self.snapshot))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Invalid snapshot {:?}", self.snapshot))
    }

    fn output_path(dir: &Path, vpa: &VpaId) -> PathBuf {
        dir.join(format!("{}_{}.json", vpa.namespace, vpa.name))
    }
}

#[async_trait]
impl ClusterSource for SnapshotSource {
    async fn list_vpas(&self) -> Result<Vec<VpaSpec>> {
        Ok(self.read().await?.vpas)
    }

    async fn list_pods(&self) -> Result<Vec<PodSpec>> {
        Ok(self.read().await?.pods)
    }

    async fn publish_recommendation(
        &self,
        vpa: &VpaId,
        recommendation: &BTreeMap<String, RecommendedContainerResources>,
    ) -> Result<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(&PublishedRecommendation {
            namespace: &vpa.namespace,
            name: &vpa.name,
            containers: recommendation,
        })?;

        let path = Self::output_path(dir, vpa);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to rename {:?}", tmp))?;
        debug!(vpa = %vpa, path = ?path, "Published recommendation");
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for SnapshotSource {
    async fn container_metrics(&self) -> Result<Vec<ContainerMetrics>> {
        let snapshot = self.read().await?;
        self.forward_oom_events(snapshot.oom_events);
        Ok(snapshot.metrics)
    }
}
