//! Tick driver
//!
//! Each tick advances the liveness watchdog, refreshes node groups, pulls
//! every group's instances and, when due, runs one recommender iteration.
//! Ticks that overrun the interval are skipped rather than queued.

use crate::cloudprovider::{CloudProvider, NodeGroup};
use crate::error::ProviderError;
use crate::health::{components, HealthRegistry};
use crate::recommender::RecommenderRoutine;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub groups: usize,
    pub instances: usize,
    pub group_errors: usize,
    pub refreshed: bool,
    pub recommender_ran: bool,
}

pub struct ReconcileLoop {
    provider: Arc<CloudProvider>,
    health: HealthRegistry,
    scan_interval: Duration,
    recommender: Option<RecommenderRoutine>,
    recommender_interval: Duration,
    last_recommendation: Option<Instant>,
}

impl ReconcileLoop {
    pub fn builder() -> ReconcileLoopBuilder {
        ReconcileLoopBuilder::new()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.scan_interval.as_secs(),
            recommender = self.recommender.is_some(),
            "Starting reconcile loop"
        );

        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let summary = self.tick().await;
                    debug!(
                        groups = summary.groups,
                        instances = summary.instances,
                        errors = summary.group_errors,
                        elapsed_ms = start.elapsed().as_millis(),
                        "Tick complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconcile loop");
                    break;
                }
            }
        }
    }

    /// Runs one tick.
    pub async fn tick(&mut self) -> TickSummary {
        self.health.touch().await;
        let mut summary = TickSummary::default();

        match self.provider.refresh().await {
            Ok(outcome) => {
                summary.refreshed = outcome.is_some();
                self.health.set_healthy(components::DISCOVERY).await;
            }
            Err(e) => {
                warn!(error = %e, "Node group refresh failed");
                self.report(components::DISCOVERY, &e).await;
            }
        }

        let groups = self.provider.node_groups().await;
        summary.groups = groups.len();

        // One slow group must not hold up the others.
        let mut listings = JoinSet::new();
        for group in groups {
            listings.spawn(async move {
                let result = group.nodes().await;
                (group, result)
            });
        }

        let mut last_error = None;
        while let Some(joined) = listings.join_next().await {
            let (group, result) = match joined {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(error = %e, "Instance listing task failed");
                    summary.group_errors += 1;
                    continue;
                }
            };
            match result {
                Ok(instances) => {
                    debug!(node_group = %group.id(), instances = instances.len(), "Listed instances");
                    summary.instances += instances.len();
                }
                Err(e) => {
                    warn!(node_group = %group.id(), error = %e, "Failed to list instances");
                    summary.group_errors += 1;
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => self.report(components::PROVIDER, &e).await,
            None => self.health.set_healthy(components::PROVIDER).await,
        }

        summary.recommender_ran = self.maybe_recommend().await;
        summary
    }

    async fn maybe_recommend(&mut self) -> bool {
        let Some(routine) = self.recommender.as_mut() else {
            return false;
        };
        if let Some(last) = self.last_recommendation {
            if last.elapsed() < self.recommender_interval {
                return false;
            }
        }
        self.last_recommendation = Some(Instant::now());

        let summary = routine.run_once(Utc::now()).await;
        self.health.set_healthy(components::RECOMMENDER).await;
        if summary.checkpoints_failed > 0 {
            self.health
                .set_degraded(
                    components::CHECKPOINTS,
                    format!("{} checkpoint writes failed", summary.checkpoints_failed),
                )
                .await;
        } else {
            self.health.set_healthy(components::CHECKPOINTS).await;
        }
        true
    }

    async fn report(&self, component: &str, err: &ProviderError) {
        if err.is_transient() {
            self.health.set_degraded(component, err.to_string()).await;
        } else {
            self.health.set_unhealthy(component, err.to_string()).await;
        }
    }
}

/// Builder for [`ReconcileLoop`]
pub struct ReconcileLoopBuilder {
    provider: Option<Arc<CloudProvider>>,
    health: Option<HealthRegistry>,
    scan_interval: Duration,
    recommender: Option<RecommenderRoutine>,
    recommender_interval: Duration,
}

impl ReconcileLoopBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            health: None,
            scan_interval: Duration::from_secs(10),
            recommender: None,
            recommender_interval: Duration::from_secs(60),
        }
    }

    pub fn provider(mut self, provider: Arc<CloudProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Runs `routine` at most once per `interval`, on the tick driver.
    pub fn recommender(mut self, routine: RecommenderRoutine, interval: Duration) -> Self {
        self.recommender = Some(routine);
        self.recommender_interval = interval;
        self
    }

    pub fn build(self) -> Result<ReconcileLoop> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("Provider is required"))?;
        let health = self
            .health
            .ok_or_else(|| anyhow::anyhow!("Health registry is required"))?;
        if self.scan_interval.is_zero() {
            anyhow::bail!("Scan interval must be positive");
        }

        Ok(ReconcileLoop {
            provider,
            health,
            scan_interval: self.scan_interval,
            recommender: self.recommender,
            recommender_interval: self.recommender_interval,
            last_recommendation: None,
        })
    }
}

impl Default for ReconcileLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::fixtures::{node_group, FakeCloud, CLUSTER_NAME};
    use crate::cloudprovider::{
        AutoDiscoveryConfig, DiscoveryMode, EngineSettings, NativeAdapter, ProviderAdapter,
        StaticGroupSpec,
    };
    use crate::health::ComponentStatus;
    use crate::models::{DiscoveredGroup, Instance, NodeHandle, NodeRef, NodeTemplate};
    use crate::observability::StructuredLogger;
    use crate::recommender::checkpoint::{CheckpointWriter, InMemoryCheckpointStore};
    use crate::recommender::input::tests::StaticSource;
    use crate::recommender::input::{oom_channel, ClusterFeeder};
    use crate::recommender::RecommenderConfig;

    const NG1: &str = "3d4bbc26-0ab6-4d3b-b4c9-2bc06a47d5ce";

    async fn provider(cloud: &Arc<FakeCloud>) -> Arc<CloudProvider> {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(
            NativeAdapter::connect(CLUSTER_NAME, cloud.clone(), cloud.clone(), cloud.clone())
                .await
                .unwrap(),
        );
        let mode = DiscoveryMode::Auto(vec![AutoDiscoveryConfig {
            roles: vec!["worker".into()],
        }]);
        Arc::new(
            CloudProvider::initialize(adapter, mode, EngineSettings::default())
                .await
                .unwrap()
                .with_discovery_interval(Duration::ZERO),
        )
    }

    fn cloud() -> Arc<FakeCloud> {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_node_group(
            node_group(NG1, "default-worker", "worker", 1, 1, Some(3)),
            vec![],
            &[],
        );
        cloud
    }

    fn routine() -> RecommenderRoutine {
        let source = Arc::new(StaticSource::default());
        let (_tx, rx) = oom_channel(4);
        let feeder = ClusterFeeder::new(
            source.clone(),
            source,
            rx,
            CheckpointWriter::new(Arc::new(InMemoryCheckpointStore::new())),
            RecommenderConfig::default(),
        );
        RecommenderRoutine::new(feeder, RecommenderConfig::default(), StructuredLogger::new("test"))
    }

    #[test]
    fn test_builder_requires_provider() {
        let result = ReconcileLoop::builder().health(HealthRegistry::default()).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tick_refreshes_and_reports_health() {
        let cloud = cloud();
        let health = HealthRegistry::default();
        let mut reconcile = ReconcileLoop::builder()
            .provider(provider(&cloud).await)
            .health(health.clone())
            .build()
            .unwrap();

        let summary = reconcile.tick().await;
        assert!(summary.refreshed);
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.group_errors, 0);
        assert!(!summary.recommender_ran);
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);

        cloud.fail("list_node_groups", ProviderError::Unavailable("503".into()));
        reconcile.tick().await;
        let report = health.health().await;
        assert_eq!(report.status, ComponentStatus::Degraded);
        assert_eq!(
            report.components[components::DISCOVERY].status,
            ComponentStatus::Degraded
        );
    }

    /// Adapter whose listings only complete once every group is being
    /// listed at the same time
    struct RendezvousAdapter {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for RendezvousAdapter {
        fn name(&self) -> &'static str {
            "rendezvous"
        }

        async fn size(&self, _group_id: &str) -> crate::ProviderResult<i64> {
            Ok(1)
        }

        async fn update_size(&self, _group_id: &str, _count: i64) -> crate::ProviderResult<()> {
            Ok(())
        }

        async fn list_instances(&self, _group_id: &str) -> crate::ProviderResult<Vec<Instance>> {
            self.barrier.wait().await;
            Ok(Vec::new())
        }

        async fn delete_instances(
            &self,
            _group_id: &str,
            _nodes: &[NodeRef],
            _new_count: i64,
            _deadline: Instant,
        ) -> crate::ProviderResult<()> {
            Ok(())
        }

        async fn discover_groups(
            &self,
            _configs: &[AutoDiscoveryConfig],
        ) -> crate::ProviderResult<Vec<DiscoveredGroup>> {
            Err(ProviderError::NotImplemented("discovery"))
        }

        async fn identify(&self, group: &str) -> crate::ProviderResult<(String, String)> {
            Ok((group.to_string(), group.to_string()))
        }

        async fn owner_of(&self, _node: &NodeHandle) -> crate::ProviderResult<String> {
            Err(ProviderError::NotFound("node".into()))
        }

        async fn can_mutate(&self) -> crate::ProviderResult<(bool, String)> {
            Ok((true, "CREATE_COMPLETE".into()))
        }

        async fn template_node_info(
            &self,
            _group: &DiscoveredGroup,
        ) -> crate::ProviderResult<NodeTemplate> {
            Err(ProviderError::NotImplemented("templates"))
        }
    }

    #[tokio::test]
    async fn test_groups_are_listed_concurrently() {
        let specs = ["first", "second"]
            .into_iter()
            .map(|name| StaticGroupSpec {
                min_size: 1,
                max_size: 3,
                name: name.into(),
            })
            .collect();
        let adapter = Arc::new(RendezvousAdapter {
            barrier: tokio::sync::Barrier::new(2),
        });
        let provider = CloudProvider::initialize(adapter, DiscoveryMode::Static(specs), EngineSettings::default())
            .await
            .unwrap();
        let health = HealthRegistry::default();
        let mut reconcile = ReconcileLoop::builder()
            .provider(Arc::new(provider))
            .health(health.clone())
            .build()
            .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), reconcile.tick())
            .await
            .expect("listings of both groups overlap");
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.group_errors, 0);
        assert_eq!(
            health.health().await.components[components::PROVIDER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_recommender_runs_on_its_own_interval() {
        let cloud = cloud();
        let health = HealthRegistry::default();
        let mut reconcile = ReconcileLoop::builder()
            .provider(provider(&cloud).await)
            .health(health.clone())
            .recommender(routine(), Duration::from_secs(3600))
            .build()
            .unwrap();

        assert!(reconcile.tick().await.recommender_ran);
        assert!(!reconcile.tick().await.recommender_ran);
        assert!(health
            .health()
            .await
            .components
            .contains_key(components::CHECKPOINTS));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let cloud = cloud();
        let reconcile = ReconcileLoop::builder()
            .provider(provider(&cloud).await)
            .health(HealthRegistry::default())
            .scan_interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconcile.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
