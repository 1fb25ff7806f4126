//! Engine-backed node group
//!
//! Implements the orchestrator-facing `NodeGroup` contract on top of a
//! `ProviderAdapter`. Every mutation runs under the cluster-wide update lock.
//! Concurrent `delete_nodes` calls are gathered into one batch that a single
//! executor hands to the adapter.

use super::{NodeGroup, ProviderAdapter};
use crate::error::{ProviderError, ProviderResult};
use crate::models::{DiscoveredGroup, Instance, NodeGroupStatus, NodeRef, NodeTemplate};
use crate::observability::{AutoscalerMetrics, StructuredLogger};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Timing knobs of the node-group engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root deadline applied to each orchestrator-facing operation
    pub operation_timeout: Duration,
    /// How long the delete executor waits for more requests to join a batch
    pub batch_window: Duration,
    /// How long a fetched group size is reused by delete requests
    pub size_cache_ttl: Duration,
    /// Cluster name attached to scale events
    pub cluster_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(15 * 60),
            batch_window: Duration::from_secs(2),
            size_cache_ttl: Duration::from_secs(10),
            cluster_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub min: i64,
    pub max: i64,
}

type BatchOutcome = Option<Result<(), ProviderError>>;

/// Pending deletions and the group size they are checked against
struct DeleteBatch {
    nodes: Vec<NodeRef>,
    outcome: watch::Sender<BatchOutcome>,
    cached_size: Option<(i64, Instant)>,
}

impl DeleteBatch {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            outcome: watch::channel(None).0,
            cached_size: None,
        }
    }
}

pub struct ManagedNodeGroup {
    id: String,
    uuid: String,
    adapter: Arc<dyn ProviderAdapter>,
    cluster_lock: Arc<Mutex<()>>,
    limits: RwLock<SizeLimits>,
    target_size: AtomicI64,
    batch: Mutex<DeleteBatch>,
    template: RwLock<Option<NodeTemplate>>,
    settings: EngineSettings,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
}

fn timed_out(what: &str) -> ProviderError {
    ProviderError::Timeout(format!("deadline exceeded while {}", what))
}

impl ManagedNodeGroup {
    pub fn new(
        id: impl Into<String>,
        uuid: impl Into<String>,
        limits: SizeLimits,
        target_size: i64,
        adapter: Arc<dyn ProviderAdapter>,
        cluster_lock: Arc<Mutex<()>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            id: id.into(),
            uuid: uuid.into(),
            adapter,
            cluster_lock,
            limits: RwLock::new(limits),
            target_size: AtomicI64::new(target_size),
            batch: Mutex::new(DeleteBatch::new()),
            template: RwLock::new(None),
            logger: StructuredLogger::new(settings.cluster_name.clone()),
            settings,
            metrics: AutoscalerMetrics::new(),
        }
    }

    pub fn with_template(self, template: NodeTemplate) -> Self {
        if let Ok(mut slot) = self.template.write() {
            *slot = Some(template);
        }
        self
    }

    /// Stable identifier
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    fn limits(&self) -> SizeLimits {
        match self.limits.read() {
            Ok(limits) => *limits,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Applies limits reported by discovery. The target size is left
    /// alone. Returns true if a limit changed.
    pub fn update_from_discovery(&self, group: &DiscoveredGroup) -> bool {
        let mut changed = false;
        if let Ok(mut limits) = self.limits.write() {
            if limits.min != group.min_size {
                info!(node_group = %self.id, min = group.min_size, "Node group min node count changed");
                limits.min = group.min_size;
                changed = true;
            }
            if limits.max != group.max_size {
                info!(node_group = %self.id, max = group.max_size, "Node group max node count changed");
                limits.max = group.max_size;
                changed = true;
            }
        }
        changed
    }

    /// Publishes the size gauges and counts failed operations.
    fn observe<T>(&self, operation: &str, result: ProviderResult<T>) -> ProviderResult<T> {
        if let Err(e) = &result {
            self.metrics.inc_provider_errors(operation, e.kind());
        }
        self.publish_sizes();
        result
    }

    pub fn publish_sizes(&self) {
        let limits = self.limits();
        self.metrics
            .set_node_group_sizes(&self.id, limits.min, limits.max, self.target_size());
    }

    pub fn status(&self) -> NodeGroupStatus {
        let limits = self.limits();
        NodeGroupStatus {
            id: self.id.clone(),
            uuid: self.uuid.clone(),
            min_size: limits.min,
            max_size: limits.max,
            target_size: self.target_size(),
        }
    }

    async fn check_can_mutate(&self) -> ProviderResult<()> {
        let (ok, status) = self.adapter.can_mutate().await?;
        if !ok {
            return Err(ProviderError::StatusBlocked { status });
        }
        Ok(())
    }

    /// Returns the cached group size, fetching it if older than the TTL.
    async fn cached_size(&self, batch: &mut DeleteBatch) -> ProviderResult<i64> {
        if let Some((size, fetched)) = batch.cached_size {
            if fetched.elapsed() < self.settings.size_cache_ttl {
                return Ok(size);
            }
        }
        let size = self.adapter.size(&self.uuid).await?;
        batch.cached_size = Some((size, Instant::now()));
        Ok(size)
    }

    /// Runs the pending batch if there is one. Must be the only place that
    /// drains the batch, and only under the cluster lock.
    async fn execute_pending(&self, deadline: Instant) {
        let _cluster = self.cluster_lock.lock().await;

        if self.batch.lock().await.nodes.is_empty() {
            return;
        }

        // Let concurrent callers join before draining.
        sleep_until((Instant::now() + self.settings.batch_window).min(deadline)).await;

        let (nodes, size, outcome) = {
            let mut batch = self.batch.lock().await;
            if batch.nodes.is_empty() {
                return;
            }
            let nodes = std::mem::take(&mut batch.nodes);
            let outcome = std::mem::replace(&mut batch.outcome, watch::channel(None).0);
            let size = self.cached_size(&mut batch).await;
            (nodes, size, outcome)
        };

        let result = match size {
            Ok(size) => self.delete_batch(&nodes, size, deadline).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(node_group = %self.id, nodes = nodes.len(), error = %e, "Failed to delete nodes");
        }
        outcome.send_replace(Some(result));
    }

    async fn delete_batch(&self, nodes: &[NodeRef], size: i64, deadline: Instant) -> ProviderResult<()> {
        self.check_can_mutate().await?;

        let min = self.limits().min;
        let new_size = size - nodes.len() as i64;
        if new_size < min {
            return Err(ProviderError::InvariantViolated(format!(
                "deleting {} nodes would take nodegroup below minimum size {}",
                nodes.len(),
                min
            )));
        }

        info!(
            node_group = %self.id,
            nodes = nodes.len(),
            from = size,
            to = new_size,
            "Deleting nodes"
        );
        self.adapter
            .delete_instances(&self.uuid, nodes, new_size, deadline)
            .await?;

        match self.adapter.size(&self.uuid).await {
            Ok(current) => {
                self.target_size.store(current, Ordering::SeqCst);
                self.batch.lock().await.cached_size = Some((current, Instant::now()));
                Ok(())
            }
            Err(e) => {
                self.target_size.store(new_size, Ordering::SeqCst);
                self.batch.lock().await.cached_size = None;
                Err(e)
            }
        }
    }
}

impl ManagedNodeGroup {
    async fn grow(&self, delta: i64) -> ProviderResult<()> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        if delta <= 0 {
            return Err(ProviderError::InvariantViolated(
                "size increase must be positive".into(),
            ));
        }

        let _cluster = timeout_at(deadline, self.cluster_lock.lock())
            .await
            .map_err(|_| timed_out("waiting for the cluster update lock"))?;

        let target = self.target_size();
        let new_target = target + delta;
        let max = self.max_size();
        if new_target > max {
            return Err(ProviderError::InvariantViolated(format!(
                "size increase too large, desired: {} max: {}",
                new_target, max
            )));
        }

        timeout_at(deadline, self.check_can_mutate())
            .await
            .map_err(|_| timed_out("checking cluster status"))??;

        info!(node_group = %self.id, from = target, to = new_target, "Increasing node group size");
        timeout_at(deadline, self.adapter.update_size(&self.uuid, new_target))
            .await
            .map_err(|_| timed_out("resizing"))??;
        self.target_size.store(new_target, Ordering::SeqCst);

        timeout_at(deadline, self.adapter.wait_for_resize(deadline))
            .await
            .map_err(|_| timed_out("waiting for the resize"))?
    }

    async fn queue_delete(&self, nodes: Vec<NodeRef>) -> ProviderResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.settings.operation_timeout;

        let mut outcome = {
            let mut batch = timeout_at(deadline, self.batch.lock())
                .await
                .map_err(|_| timed_out("waiting for the delete batch"))?;
            let size = self.cached_size(&mut batch).await?;
            let queued = batch.nodes.len() as i64;
            let min = self.min_size();
            if size - (queued + nodes.len() as i64) < min {
                return Err(ProviderError::InvariantViolated(format!(
                    "deleting {} nodes would take nodegroup below minimum size {}",
                    nodes.len(),
                    min
                )));
            }
            debug!(node_group = %self.id, nodes = nodes.len(), queued = queued, "Queued nodes for deletion");
            batch.nodes.extend(nodes);
            batch.outcome.subscribe()
        };

        timeout_at(deadline, self.execute_pending(deadline))
            .await
            .map_err(|_| timed_out("deleting nodes"))?;

        // The batch holding these nodes has run by now, either here or in
        // the executor that held the cluster lock before us.
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| Err(timed_out("deleting nodes in another request")))
    }

    async fn shrink_target(&self, delta: i64) -> ProviderResult<()> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        if delta >= 0 {
            return Err(ProviderError::InvariantViolated(
                "size decrease must be negative".into(),
            ));
        }

        let _cluster = timeout_at(deadline, self.cluster_lock.lock())
            .await
            .map_err(|_| timed_out("waiting for the cluster update lock"))?;

        let target = self.target_size();
        let new_target = target + delta;
        let min = self.min_size();
        if new_target < min {
            return Err(ProviderError::InvariantViolated(format!(
                "size decrease too large, desired: {} min: {}",
                new_target, min
            )));
        }

        timeout_at(deadline, self.check_can_mutate())
            .await
            .map_err(|_| timed_out("checking cluster status"))??;

        info!(node_group = %self.id, from = target, to = new_target, "Decreasing target size");
        timeout_at(deadline, self.adapter.update_size(&self.uuid, new_target))
            .await
            .map_err(|_| timed_out("resizing"))??;
        self.target_size.store(new_target, Ordering::SeqCst);

        timeout_at(deadline, self.adapter.wait_for_resize(deadline))
            .await
            .map_err(|_| timed_out("waiting for the resize"))?
    }
}

#[async_trait]
impl NodeGroup for ManagedNodeGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn min_size(&self) -> i64 {
        self.limits().min
    }

    fn max_size(&self) -> i64 {
        self.limits().max
    }

    fn target_size(&self) -> i64 {
        self.target_size.load(Ordering::SeqCst)
    }

    async fn increase_size(&self, delta: i64) -> ProviderResult<()> {
        let result = self.grow(delta).await;
        if result.is_ok() {
            self.metrics.record_scale_up(&self.id, delta as u64);
            self.logger.log_scale_up(&self.id, delta, self.target_size());
        }
        self.observe("increase_size", result)
    }

    async fn delete_nodes(&self, nodes: Vec<NodeRef>) -> ProviderResult<()> {
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let result = self.queue_delete(nodes).await;
        if result.is_ok() && !names.is_empty() {
            self.metrics.record_scale_down(&self.id, names.len() as u64);
            self.logger.log_scale_down(&self.id, &names, self.target_size());
        }
        self.observe("delete_nodes", result)
    }

    async fn decrease_target_size(&self, delta: i64) -> ProviderResult<()> {
        let result = self.shrink_target(delta).await;
        self.observe("decrease_target_size", result)
    }

    async fn nodes(&self) -> ProviderResult<Vec<Instance>> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        let result = timeout_at(deadline, self.adapter.list_instances(&self.uuid))
            .await
            .map_err(|_| timed_out("listing instances"))
            .and_then(|r| r);
        self.observe("nodes", result)
    }

    async fn template_node_info(&self) -> ProviderResult<NodeTemplate> {
        let template = self.template.read().ok().and_then(|t| t.clone());
        template.ok_or(ProviderError::NotImplemented("node template for this node group"))
    }
}
