//! Checkpoint persistence for aggregate container states
//!
//! One record is kept per (namespace, scaler, container) and overwritten on
//! every flush. Stores are behind the [`CheckpointStore`] trait so the
//! recommender can run against a directory on disk or an in-memory map.

use super::aggregate::{AggregateCheckpoint, AggregateContainerState};
use super::cluster::ClusterState;
use super::vpa::VpaId;
use crate::error::CheckpointError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A persisted aggregate, addressed by its owning scaler and container name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub namespace: String,
    pub vpa_name: String,
    pub container_name: String,
    pub checkpoint: AggregateCheckpoint,
    pub last_update: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn vpa_id(&self) -> VpaId {
        VpaId::new(&self.namespace, &self.vpa_name)
    }

    fn storage_key(&self) -> String {
        storage_key(&self.namespace, &self.vpa_name, &self.container_name)
    }
}

fn storage_key(namespace: &str, vpa_name: &str, container: &str) -> String {
    format!("{}/{}/{}", namespace, vpa_name, container)
}

/// Persistent store of checkpoint records
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// All records, optionally restricted to one namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// Creates or overwrites the record for its key.
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    async fn delete(&self, namespace: &str, vpa_name: &str, container: &str) -> Result<(), CheckpointError>;
}

/// Stores each record as a JSON file named after the SHA-256 of its key.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CheckpointRecord>(&bytes) {
                Ok(record) => {
                    if namespace.map_or(true, |ns| ns == record.namespace) {
                        records.push(record);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(records)
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.path_for(&record.storage_key());
        let temp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec(record)?;

        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, vpa_name: &str, container: &str) -> Result<(), CheckpointError> {
        let key = storage_key(namespace, vpa_name, container);
        match tokio::fs::remove_file(self.path_for(&key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CheckpointError::NotFound(key)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps records in memory. Used when no checkpoint directory is configured.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: DashMap<String, CheckpointRecord>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| namespace.map_or(true, |ns| ns == entry.namespace))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.records.insert(record.storage_key(), record.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, vpa_name: &str, container: &str) -> Result<(), CheckpointError> {
        let key = storage_key(namespace, vpa_name, container);
        self.records
            .remove(&key)
            .map(|_| ())
            .ok_or(CheckpointError::NotFound(key))
    }
}

/// Result of one checkpoint flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub failed: usize,
    /// Scalers left for the next flush because the deadline passed
    pub deferred: usize,
}

/// Writes checkpoints for scalers and reaps those of deleted scalers.
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Writes one checkpoint per container of every scaler, least recently
    /// checkpointed first, until `deadline` passes. A failed container does
    /// not stop the flush.
    pub async fn store_checkpoints(
        &self,
        cluster: &mut ClusterState,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> WriteSummary {
        let mut order: Vec<(Option<DateTime<Utc>>, VpaId)> = cluster
            .vpas()
            .map(|vpa| (vpa.checkpoint_written, vpa.id.clone()))
            .collect();
        order.sort();

        let mut summary = WriteSummary::default();
        let total = order.len();
        for (position, (_, id)) in order.into_iter().enumerate() {
            if Instant::now() >= deadline {
                summary.deferred = total - position;
                info!(deferred = summary.deferred, "Checkpoint write deadline reached");
                break;
            }

            let states = cluster.aggregate_states_for_vpa(&id);
            let mut vpa_failed = false;
            for (container, state) in &states {
                if state.is_empty() && state.window_end().is_none() {
                    continue;
                }
                match self.store.save(&record_for(&id, container, state, now)).await {
                    Ok(()) => summary.written += 1,
                    Err(e) => {
                        warn!(vpa = %id, container = %container, error = %e, "Failed to write checkpoint");
                        summary.failed += 1;
                        vpa_failed = true;
                    }
                }
            }
            if !vpa_failed {
                if let Some(vpa) = cluster.vpa_mut(&id) {
                    vpa.checkpoint_written = Some(now);
                }
            }
        }
        summary
    }

    /// Adopts stored checkpoints as initial state of matching scalers.
    /// Returns the number of checkpoints loaded.
    pub async fn load_into(
        &self,
        cluster: &mut ClusterState,
        namespace: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize, CheckpointError> {
        let settings = *cluster.settings();
        let mut loaded = 0;
        for record in self.store.list(namespace).await? {
            let id = record.vpa_id();
            let Some(vpa) = cluster.vpa_mut(&id) else {
                debug!(vpa = %id, "Skipping checkpoint of unknown vertical scaler");
                continue;
            };
            match AggregateContainerState::from_checkpoint(settings, &record.checkpoint, now) {
                Ok(state) => {
                    vpa.merge_checkpointed_state(&record.container_name, state);
                    loaded += 1;
                }
                Err(e) => warn!(
                    vpa = %id,
                    container = %record.container_name,
                    error = %e,
                    "Ignoring invalid checkpoint"
                ),
            }
        }
        Ok(loaded)
    }

    /// Deletes every checkpoint whose scaler is not in `live`.
    pub async fn garbage_collect(
        &self,
        live: &HashSet<VpaId>,
        namespace: Option<&str>,
    ) -> Result<usize, CheckpointError> {
        let mut deleted = 0;
        for record in self.store.list(namespace).await? {
            if live.contains(&record.vpa_id()) {
                continue;
            }
            match self
                .store
                .delete(&record.namespace, &record.vpa_name, &record.container_name)
                .await
            {
                Ok(()) | Err(CheckpointError::NotFound(_)) => {
                    info!(
                        namespace = %record.namespace,
                        vpa = %record.vpa_name,
                        container = %record.container_name,
                        "Deleted orphaned checkpoint"
                    );
                    deleted += 1;
                }
                Err(e) => warn!(vpa = %record.vpa_id(), error = %e, "Failed to delete checkpoint"),
            }
        }
        Ok(deleted)
    }
}

fn record_for(
    id: &VpaId,
    container: &str,
    state: &AggregateContainerState,
    now: DateTime<Utc>,
) -> CheckpointRecord {
    CheckpointRecord {
        namespace: id.namespace.clone(),
        vpa_name: id.name.clone(),
        container_name: container.to_string(),
        checkpoint: state.save_to_checkpoint(),
        last_update: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommender::aggregate::AggregationSettings;
    use crate::recommender::recommendation::Resources;
    use crate::recommender::vpa::{UpdateMode, VpaSpec};
    use crate::recommender::{ContainerId, Labels, PodId, PodPhase, UsageSample};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn labels(app: &str) -> Labels {
        [("app".to_string(), app.to_string())].into()
    }

    fn spec(name: &str) -> VpaSpec {
        VpaSpec {
            id: VpaId::new("default", name),
            selector: labels(name),
            update_mode: UpdateMode::Auto,
            container_policies: HashMap::new(),
            created: Utc::now(),
        }
    }

    fn cluster_with_samples(apps: &[&str]) -> ClusterState {
        let mut cluster = ClusterState::new(AggregationSettings::default(), Duration::from_secs(3600));
        let now = Utc::now();
        for app in apps {
            cluster.add_or_update_vpa(&spec(app));
            let pod = PodId::new("default", format!("{}-1", app));
            cluster.add_or_update_pod(pod.clone(), labels(app), PodPhase::Running);
            let container = ContainerId::new(pod, "main");
            cluster
                .add_or_update_container(&container, Resources::new(1.0, 1e9))
                .unwrap();
            cluster
                .add_sample(&container, &UsageSample::cpu(now, 0.3, 1.0))
                .unwrap();
            cluster
                .add_sample(&container, &UsageSample::memory(now, 2e8))
                .unwrap();
        }
        cluster
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints")).await.unwrap();
        let state = AggregateContainerState::new(AggregationSettings::default(), Utc::now());
        let record = record_for(&VpaId::new("default", "web"), "main", &state, Utc::now());

        store.save(&record).await.unwrap();
        store.save(&record).await.unwrap();
        let listed = store.list(None).await.unwrap();
        assert_eq!(listed, vec![record.clone()]);
        assert!(store.list(Some("other")).await.unwrap().is_empty());

        store.delete("default", "web", "main").await.unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(matches!(
            store.delete("default", "web", "main").await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_and_reload_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = CheckpointWriter::new(store.clone());
        let mut cluster = cluster_with_samples(&["web", "db"]);

        let summary = writer
            .store_checkpoints(&mut cluster, Utc::now(), far_deadline())
            .await;
        assert_eq!(summary.written, 2);
        assert_eq!(store.len(), 2);
        assert!(cluster.vpas().all(|vpa| vpa.checkpoint_written.is_some()));

        // A fresh model picks the state up again.
        let mut restarted = ClusterState::new(AggregationSettings::default(), Duration::from_secs(3600));
        restarted.add_or_update_vpa(&spec("web"));
        let loaded = writer.load_into(&mut restarted, None, Utc::now()).await.unwrap();
        assert_eq!(loaded, 1);
        let states = restarted.aggregate_states_for_vpa(&VpaId::new("default", "web"));
        assert_eq!(states["main"].total_samples(), 1);
    }

    #[tokio::test]
    async fn test_least_recently_written_goes_first() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = CheckpointWriter::new(store.clone());
        let mut cluster = cluster_with_samples(&["web", "db"]);
        let earlier = Utc::now() - chrono::Duration::hours(1);
        cluster
            .vpa_mut(&VpaId::new("default", "db"))
            .unwrap()
            .checkpoint_written = Some(earlier);
        cluster
            .vpa_mut(&VpaId::new("default", "web"))
            .unwrap()
            .checkpoint_written = Some(Utc::now());

        // A deadline already in the past defers everything.
        let summary = writer
            .store_checkpoints(&mut cluster, Utc::now(), Instant::now())
            .await;
        assert_eq!(summary, WriteSummary { written: 0, failed: 0, deferred: 2 });

        let now = Utc::now();
        writer.store_checkpoints(&mut cluster, now, far_deadline()).await;
        let records = store.list(None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            cluster.vpa(&VpaId::new("default", "db")).unwrap().checkpoint_written,
            Some(now)
        );
    }

    #[tokio::test]
    async fn test_garbage_collect_orphans() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = CheckpointWriter::new(store.clone());
        let mut cluster = cluster_with_samples(&["web", "db"]);
        writer
            .store_checkpoints(&mut cluster, Utc::now(), far_deadline())
            .await;

        let live: HashSet<VpaId> = [VpaId::new("default", "web")].into();
        assert_eq!(writer.garbage_collect(&live, None).await.unwrap(), 1);
        let remaining = store.list(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].vpa_name, "web");
    }

    #[tokio::test]
    async fn test_invalid_checkpoint_is_ignored() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let state = AggregateContainerState::new(AggregationSettings::default(), Utc::now());
        let mut record = record_for(&VpaId::new("default", "web"), "main", &state, Utc::now());
        record.checkpoint.version = "v1".into();
        store.save(&record).await.unwrap();

        let writer = CheckpointWriter::new(store);
        let mut cluster = ClusterState::new(AggregationSettings::default(), Duration::from_secs(3600));
        cluster.add_or_update_vpa(&spec("web"));
        assert_eq!(writer.load_into(&mut cluster, None, Utc::now()).await.unwrap(), 0);
    }
}
