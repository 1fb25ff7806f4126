//! Node-group registry for one cluster
//!
//! Owns the registered node groups, keeps them in sync with auto-discovery
//! and maps nodes back to their group.

use super::discovery::{AutoDiscoveryConfig, DiscoveryMode, StaticGroupSpec};
use super::node_group::{EngineSettings, ManagedNodeGroup, SizeLimits};
use super::{NodeGroup, ProviderAdapter};
use crate::error::{ProviderError, ProviderResult};
use crate::models::{DiscoveredGroup, NodeGroupStatus, NodeHandle};
use crate::observability::{AutoscalerMetrics, StructuredLogger};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Nodes carrying either label belong to the control plane
pub const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// Default minimum time between two auto-discovery runs
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Changes applied by one discovery refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Unique ids of newly registered groups
    pub added: Vec<String>,
    /// Unique ids of deregistered groups
    pub dropped: Vec<String>,
    /// Number of groups whose limits changed
    pub updated: usize,
}

impl RefreshOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty() && self.updated == 0
    }
}

pub struct CloudProvider {
    adapter: Arc<dyn ProviderAdapter>,
    cluster_lock: Arc<Mutex<()>>,
    groups: RwLock<Vec<Arc<ManagedNodeGroup>>>,
    /// Empty in static mode
    discovery: Vec<AutoDiscoveryConfig>,
    discovery_interval: Duration,
    last_discovery: Mutex<Option<Instant>>,
    settings: EngineSettings,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
}

impl CloudProvider {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, settings: EngineSettings) -> Self {
        Self {
            adapter,
            cluster_lock: Arc::new(Mutex::new(())),
            groups: RwLock::new(Vec::new()),
            discovery: Vec::new(),
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            last_discovery: Mutex::new(None),
            logger: StructuredLogger::new(settings.cluster_name.clone()),
            settings,
            metrics: AutoscalerMetrics::new(),
        }
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Builds the provider and registers its initial node groups.
    pub async fn initialize(
        adapter: Arc<dyn ProviderAdapter>,
        mode: DiscoveryMode,
        settings: EngineSettings,
    ) -> ProviderResult<Self> {
        let mut provider = Self::new(adapter, settings);
        match mode {
            DiscoveryMode::Static(specs) => provider.register_static(&specs).await?,
            DiscoveryMode::Auto(configs) => {
                provider.discovery = configs;
                provider.refresh_node_groups().await?;
            }
        }
        Ok(provider)
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn auto_discovery(&self) -> bool {
        !self.discovery.is_empty()
    }

    /// Registers statically configured groups.
    pub async fn register_static(&self, specs: &[StaticGroupSpec]) -> ProviderResult<()> {
        let mut registered = Vec::with_capacity(specs.len());
        for spec in specs {
            let (unique, stable) = self.adapter.identify(&spec.name).await?;
            let size = self.adapter.size(&stable).await?;
            self.adapter.prepare_group(&stable).await?;

            info!(
                node_group = %unique,
                min = spec.min_size,
                max = spec.max_size,
                size = size,
                "Registered static node group"
            );
            registered.push(Arc::new(ManagedNodeGroup::new(
                unique,
                stable,
                SizeLimits {
                    min: spec.min_size,
                    max: spec.max_size,
                },
                size,
                self.adapter.clone(),
                self.cluster_lock.clone(),
                self.settings.clone(),
            )));
        }
        for group in &registered {
            group.publish_sizes();
        }
        self.groups.write().await.extend(registered);
        Ok(())
    }

    /// Runs auto-discovery if it is due. Returns `None` when skipped.
    pub async fn refresh(&self) -> ProviderResult<Option<RefreshOutcome>> {
        if !self.auto_discovery() {
            return Ok(None);
        }
        {
            let last = self.last_discovery.lock().await;
            if let Some(last) = *last {
                if last.elapsed() < self.discovery_interval {
                    return Ok(None);
                }
            }
        }
        self.refresh_node_groups().await.map(Some)
    }

    /// Diffs discovered groups against the registered set by stable id.
    pub async fn refresh_node_groups(&self) -> ProviderResult<RefreshOutcome> {
        let started = Instant::now();
        let _cluster = self.cluster_lock.lock().await;

        let discovered = match self.adapter.discover_groups(&self.discovery).await {
            Ok(discovered) => discovered,
            Err(e) => {
                self.metrics.inc_provider_errors("discover_groups", e.kind());
                return Err(e);
            }
        };
        let known: HashSet<String> = self
            .groups
            .read()
            .await
            .iter()
            .map(|group| group.uuid().to_string())
            .collect();

        // Registration calls the cloud, so new groups are prepared before
        // the registry is locked for writing.
        let mut prepared = Vec::new();
        for found in discovered.iter().filter(|found| !known.contains(&found.id)) {
            match self.register_discovered(found).await {
                Ok(group) => prepared.push((found, group)),
                Err(e) => {
                    warn!(node_group = %found.name, error = %e, "Failed to register discovered node group");
                }
            }
        }

        let mut outcome = RefreshOutcome::default();
        let mut groups = self.groups.write().await;

        let seen: HashSet<&str> = discovered.iter().map(|g| g.id.as_str()).collect();
        groups.retain(|group| {
            if seen.contains(group.uuid()) {
                return true;
            }
            info!(node_group = %group.id(), "Node group no longer exists, deregistering");
            self.adapter.forget_group(group.uuid());
            self.metrics.remove_node_group(group.id());
            outcome.dropped.push(group.id().to_string());
            false
        });

        for found in &discovered {
            if let Some(existing) = groups.iter().find(|g| g.uuid() == found.id) {
                if existing.update_from_discovery(found) {
                    outcome.updated += 1;
                }
            }
        }

        for (found, group) in prepared {
            info!(
                node_group = %group.id(),
                min = found.min_size,
                max = found.max_size,
                size = found.node_count,
                "Discovered node group"
            );
            outcome.added.push(group.id().to_string());
            groups.push(group);
        }

        *self.last_discovery.lock().await = Some(Instant::now());
        for group in groups.iter() {
            group.publish_sizes();
        }
        let registered = groups.len();
        drop(groups);

        if !outcome.added.is_empty() {
            self.logger.log_node_groups_discovered(&outcome.added);
        }
        if !outcome.dropped.is_empty() {
            self.logger.log_node_groups_dropped(&outcome.dropped);
        }
        self.metrics
            .observe_refresh_latency(started.elapsed().as_secs_f64());
        debug!(
            groups = registered,
            added = outcome.added.len(),
            dropped = outcome.dropped.len(),
            "Refreshed node groups"
        );
        Ok(outcome)
    }

    async fn register_discovered(&self, found: &DiscoveredGroup) -> ProviderResult<Arc<ManagedNodeGroup>> {
        self.adapter.prepare_group(&found.id).await?;

        let mut group = ManagedNodeGroup::new(
            found.unique_id(),
            found.id.clone(),
            SizeLimits {
                min: found.min_size,
                max: found.max_size,
            },
            found.node_count,
            self.adapter.clone(),
            self.cluster_lock.clone(),
            self.settings.clone(),
        );
        match self.adapter.template_node_info(found).await {
            Ok(template) => group = group.with_template(template),
            Err(e) => debug!(node_group = %found.name, error = %e, "No node template"),
        }
        Ok(Arc::new(group))
    }

    /// Snapshot of the registered groups
    pub async fn node_groups(&self) -> Vec<Arc<ManagedNodeGroup>> {
        self.groups.read().await.clone()
    }

    pub async fn node_group(&self, id: &str) -> Option<Arc<ManagedNodeGroup>> {
        self.groups
            .read()
            .await
            .iter()
            .find(|g| g.id() == id || g.uuid() == id)
            .cloned()
    }

    pub async fn statuses(&self) -> Vec<NodeGroupStatus> {
        self.groups.read().await.iter().map(|g| g.status()).collect()
    }

    /// Returns the registered group owning a node. Control-plane nodes and
    /// nodes of unregistered groups belong to none.
    pub async fn node_group_for_node(
        &self,
        node: &NodeHandle,
    ) -> ProviderResult<Option<Arc<ManagedNodeGroup>>> {
        if CONTROL_PLANE_LABELS
            .iter()
            .any(|label| node.labels.contains_key(*label))
        {
            return Ok(None);
        }

        let owner = match self.adapter.owner_of(node).await {
            Ok(owner) => owner,
            Err(ProviderError::NotFound(reason)) => {
                debug!(node = %node.name, reason = %reason, "Node has no node group");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let group = self
            .groups
            .read()
            .await
            .iter()
            .find(|g| g.uuid() == owner)
            .cloned();
        if group.is_none() {
            debug!(node = %node.name, owner = %owner, "Node belongs to an unregistered node group");
        }
        Ok(group)
    }
}
