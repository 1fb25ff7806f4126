//! One recommender iteration: feed, recommend, checkpoint, collect garbage

use super::cluster::ClusterState;
use super::config::RecommenderConfig;
use super::input::ClusterFeeder;
use super::recommendation::ResourceRecommender;
use crate::observability::{AutoscalerMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// What one iteration did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutineSummary {
    pub recommendations: usize,
    pub checkpoints_written: usize,
    pub checkpoints_failed: usize,
    pub aggregates_removed: Option<usize>,
    pub checkpoints_removed: Option<usize>,
}

pub struct RecommenderRoutine {
    cluster: ClusterState,
    feeder: ClusterFeeder,
    recommender: ResourceRecommender,
    config: RecommenderConfig,
    last_checkpoint_gc: Option<DateTime<Utc>>,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
}

impl RecommenderRoutine {
    pub fn new(feeder: ClusterFeeder, config: RecommenderConfig, logger: StructuredLogger) -> Self {
        Self {
            cluster: ClusterState::new(config.aggregation_settings(), config.aggregate_gc_interval()),
            recommender: ResourceRecommender::new(&config),
            feeder,
            config,
            last_checkpoint_gc: None,
            metrics: AutoscalerMetrics::new(),
            logger,
        }
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    /// Loads initial state from checkpoints. Called once before the first
    /// iteration.
    pub async fn initialize(&mut self) -> anyhow::Result<usize> {
        self.feeder.init_from_checkpoints(&mut self.cluster).await
    }

    /// Runs one iteration. Source failures are logged and the iteration
    /// continues with the state already in the model.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> RoutineSummary {
        let mut summary = RoutineSummary::default();

        if let Err(e) = self.feeder.load_vpas(&mut self.cluster).await {
            warn!(error = %e, "Failed to load vertical scalers");
        }
        if let Err(e) = self.feeder.load_pods(&mut self.cluster).await {
            warn!(error = %e, "Failed to load pods");
        }
        if let Err(e) = self.feeder.load_metrics(&mut self.cluster).await {
            warn!(error = %e, "Failed to load container metrics");
        }
        self.feeder.drain_oom_events(&mut self.cluster);

        summary.recommendations = self.update_recommendations().await;

        let deadline = Instant::now() + self.config.checkpoints_write_timeout();
        let written = self
            .feeder
            .checkpoints()
            .store_checkpoints(&mut self.cluster, now, deadline)
            .await;
        summary.checkpoints_written = written.written;
        summary.checkpoints_failed = written.failed;
        self.metrics
            .record_checkpoints(written.written as u64, written.failed as u64);
        self.logger
            .log_checkpoints_written(written.written, written.failed, written.deferred);

        summary.aggregates_removed = self.cluster.rate_limited_garbage_collect(now);
        summary.checkpoints_removed = self.maybe_collect_checkpoints(now).await;

        self.metrics
            .set_aggregate_container_states(self.cluster.aggregate_count() as i64);
        summary
    }

    async fn update_recommendations(&mut self) -> usize {
        let mut updated = 0;
        for id in self.cluster.vpa_ids() {
            let states = self.cluster.aggregate_states_for_vpa(&id);
            let Some(vpa) = self.cluster.vpa_mut(&id) else {
                continue;
            };
            let recommendation = self.recommender.recommend_for_vpa(vpa, &states);
            if recommendation.is_empty() {
                continue;
            }
            vpa.recommendation = Some(recommendation.clone());
            updated += 1;

            if let Err(e) = self
                .feeder
                .source()
                .publish_recommendation(&id, &recommendation)
                .await
            {
                warn!(vpa = %id, error = %e, "Failed to publish recommendation");
            }
        }
        debug!(updated, "Updated recommendations");
        updated
    }

    async fn maybe_collect_checkpoints(&mut self, now: DateTime<Utc>) -> Option<usize> {
        let interval = chrono::Duration::from_std(self.config.checkpoints_gc_interval()).ok()?;
        if let Some(last) = self.last_checkpoint_gc {
            if now - last < interval {
                return None;
            }
        }
        self.last_checkpoint_gc = Some(now);
        match self.feeder.garbage_collect_checkpoints().await {
            Ok(removed) => Some(removed),
            Err(e) => {
                warn!(error = %e, "Failed to garbage collect checkpoints");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommender::checkpoint::{CheckpointStore, CheckpointWriter, InMemoryCheckpointStore};
    use crate::recommender::input::tests::{metrics, pod, vpa, StaticSource};
    use crate::recommender::input::oom_channel;
    use crate::recommender::vpa::VpaId;
    use std::sync::Arc;

    fn routine(source: Arc<StaticSource>, store: Arc<InMemoryCheckpointStore>) -> RecommenderRoutine {
        let (_tx, rx) = oom_channel(4);
        let feeder = ClusterFeeder::new(
            source.clone(),
            source,
            rx,
            CheckpointWriter::new(store),
            RecommenderConfig::default(),
        );
        RecommenderRoutine::new(feeder, RecommenderConfig::default(), StructuredLogger::new("test"))
    }

    #[tokio::test]
    async fn test_iteration_recommends_and_checkpoints() {
        let source = Arc::new(StaticSource::default());
        *source.vpas.lock().unwrap() = vec![vpa("default", "web")];
        *source.pods.lock().unwrap() = vec![pod("default", "web-1", "web")];
        *source.metrics.lock().unwrap() = vec![metrics("default", "web-1", 0.4, 3e8)];
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut routine = routine(source.clone(), store.clone());

        let summary = routine.run_once(Utc::now()).await;
        assert_eq!(summary.recommendations, 1);
        assert_eq!(summary.checkpoints_written, 1);
        assert_eq!(summary.aggregates_removed, Some(0));
        assert_eq!(summary.checkpoints_removed, Some(0));

        let published = source.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let target = published[0].1["main"].target;
        assert!(target.cpu >= 0.4 * 1.15);
        assert!(routine
            .cluster()
            .vpa(&VpaId::new("default", "web"))
            .unwrap()
            .recommendation
            .is_some());
        drop(published);
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_gc_runs_on_its_own_interval() {
        let source = Arc::new(StaticSource::default());
        *source.vpas.lock().unwrap() = vec![vpa("default", "web")];
        *source.pods.lock().unwrap() = vec![pod("default", "web-1", "web")];
        *source.metrics.lock().unwrap() = vec![metrics("default", "web-1", 0.4, 3e8)];
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut routine = routine(source.clone(), store.clone());

        let now = Utc::now();
        routine.run_once(now).await;
        assert_eq!(store.len(), 1);

        source.vpas.lock().unwrap().clear();
        let soon = routine.run_once(now + chrono::Duration::minutes(1)).await;
        assert_eq!(soon.checkpoints_removed, None);
        assert_eq!(store.len(), 1);

        let later = routine.run_once(now + chrono::Duration::minutes(11)).await;
        assert_eq!(later.checkpoints_removed, Some(1));
        assert!(store.is_empty());
    }
}
