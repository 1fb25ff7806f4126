//! In-memory model of pods, vertical scalers and usage aggregates

use super::aggregate::{AggregateContainerState, AggregationSettings};
use super::recommendation::Resources;
use super::vpa::{Vpa, VpaId, VpaSpec};
use super::{AggregateKey, ContainerId, Labels, PodId, PodPhase, ResourceKind, UsageSample};
use crate::error::ModelError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PodState {
    labels: Labels,
    phase: PodPhase,
    /// Container name -> current requests
    containers: HashMap<String, Resources>,
}

/// Pods, vertical scalers and the aggregates their containers feed
#[derive(Debug)]
pub struct ClusterState {
    pods: HashMap<PodId, PodState>,
    vpas: HashMap<VpaId, Vpa>,
    aggregates: HashMap<AggregateKey, AggregateContainerState>,
    settings: AggregationSettings,
    gc_interval: chrono::Duration,
    last_gc: Option<DateTime<Utc>>,
}

impl ClusterState {
    pub fn new(settings: AggregationSettings, gc_interval: Duration) -> Self {
        Self {
            pods: HashMap::new(),
            vpas: HashMap::new(),
            aggregates: HashMap::new(),
            settings,
            gc_interval: chrono::Duration::from_std(gc_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            last_gc: None,
        }
    }

    pub fn settings(&self) -> &AggregationSettings {
        &self.settings
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    pub fn has_pod(&self, pod: &PodId) -> bool {
        self.pods.contains_key(pod)
    }

    pub fn pod_ids(&self) -> Vec<PodId> {
        self.pods.keys().cloned().collect()
    }

    pub fn vpa(&self, id: &VpaId) -> Option<&Vpa> {
        self.vpas.get(id)
    }

    pub fn vpa_mut(&mut self, id: &VpaId) -> Option<&mut Vpa> {
        self.vpas.get_mut(id)
    }

    pub fn vpas(&self) -> impl Iterator<Item = &Vpa> {
        self.vpas.values()
    }

    pub fn vpa_ids(&self) -> Vec<VpaId> {
        self.vpas.keys().cloned().collect()
    }

    pub fn aggregate(&self, key: &AggregateKey) -> Option<&AggregateContainerState> {
        self.aggregates.get(key)
    }

    fn key_for(pod: &PodId, labels: &Labels, container: &str) -> AggregateKey {
        AggregateKey {
            namespace: pod.namespace.clone(),
            container: container.to_string(),
            labels: labels.clone(),
        }
    }

    /// Aggregate key a container feeds, if its pod is tracked
    pub fn aggregate_key(&self, container: &ContainerId) -> Option<AggregateKey> {
        self.pods
            .get(&container.pod)
            .map(|pod| Self::key_for(&container.pod, &pod.labels, &container.container))
    }

    fn find_or_create_aggregate(&mut self, key: AggregateKey, now: DateTime<Utc>) -> &mut AggregateContainerState {
        let settings = self.settings;
        let vpas = &self.vpas;
        self.aggregates.entry(key.clone()).or_insert_with(|| {
            let mut state = AggregateContainerState::new(settings, now);
            state.is_under_vpa = vpas.values().any(|vpa| vpa.matches_key(&key));
            state
        })
    }

    fn adjust_pod_counts(&mut self, pod: &PodId, labels: &Labels, increment: bool) {
        for vpa in self.vpas.values_mut() {
            if vpa.matches_pod(&pod.namespace, labels) {
                if increment {
                    vpa.pod_count += 1;
                } else {
                    vpa.pod_count = vpa.pod_count.saturating_sub(1);
                }
            }
        }
    }

    /// Inserts or updates a pod. A label change moves its containers to the
    /// aggregates of the new label set.
    pub fn add_or_update_pod(&mut self, id: PodId, labels: Labels, phase: PodPhase) {
        let existing = self.pods.get(&id).map(|pod| pod.labels.clone());
        match existing {
            Some(old_labels) if old_labels == labels => {}
            Some(old_labels) => {
                self.adjust_pod_counts(&id, &old_labels, false);
                self.adjust_pod_counts(&id, &labels, true);
                let containers: Vec<String> = self
                    .pods
                    .get(&id)
                    .map(|pod| pod.containers.keys().cloned().collect())
                    .unwrap_or_default();
                let now = Utc::now();
                for container in containers {
                    self.find_or_create_aggregate(Self::key_for(&id, &labels, &container), now);
                }
            }
            None => {
                self.adjust_pod_counts(&id, &labels, true);
            }
        }

        let pod = self.pods.entry(id).or_insert_with(|| PodState {
            labels: Labels::new(),
            phase,
            containers: HashMap::new(),
        });
        pod.labels = labels;
        pod.phase = phase;
    }

    pub fn delete_pod(&mut self, id: &PodId) {
        if let Some(pod) = self.pods.remove(id) {
            self.adjust_pod_counts(id, &pod.labels, false);
        }
    }

    /// Inserts a container of a tracked pod or updates its requests.
    pub fn add_or_update_container(&mut self, id: &ContainerId, request: Resources) -> Result<(), ModelError> {
        let pod = self
            .pods
            .get_mut(&id.pod)
            .ok_or_else(|| ModelError::PodNotFound(id.pod.to_string()))?;
        let is_new = !pod.containers.contains_key(&id.container);
        pod.containers.insert(id.container.clone(), request);
        if is_new {
            let key = Self::key_for(&id.pod, &pod.labels, &id.container);
            self.find_or_create_aggregate(key, Utc::now());
        }
        Ok(())
    }

    /// Routes a sample to the container's aggregate. CPU samples are
    /// weighted by the container's current CPU request.
    pub fn add_sample(&mut self, container: &ContainerId, sample: &UsageSample) -> Result<(), ModelError> {
        let pod = self
            .pods
            .get(&container.pod)
            .ok_or_else(|| ModelError::PodNotFound(container.pod.to_string()))?;
        let request = pod
            .containers
            .get(&container.container)
            .ok_or_else(|| ModelError::ContainerNotFound(container.to_string()))?;

        let mut sample = sample.clone();
        if sample.resource == ResourceKind::Cpu {
            sample.request = request.cpu;
        }
        let key = Self::key_for(&container.pod, &pod.labels, &container.container);
        self.find_or_create_aggregate(key, sample.measure_start)
            .add_sample(&sample)
    }

    /// Raises the memory floor of the container's aggregate.
    pub fn record_oom(
        &mut self,
        container: &ContainerId,
        time: DateTime<Utc>,
        requested_memory: f64,
    ) -> Result<(), ModelError> {
        let pod = self
            .pods
            .get(&container.pod)
            .ok_or_else(|| ModelError::PodNotFound(container.pod.to_string()))?;
        if !pod.containers.contains_key(&container.container) {
            return Err(ModelError::ContainerNotFound(container.to_string()));
        }
        let key = Self::key_for(&container.pod, &pod.labels, &container.container);
        self.find_or_create_aggregate(key, time)
            .record_oom(time, requested_memory)
    }

    /// Inserts or updates a scaler. A changed selector recreates it, which
    /// drops any checkpointed state it carried.
    pub fn add_or_update_vpa(&mut self, spec: &VpaSpec) {
        if let Some(existing) = self.vpas.get_mut(&spec.id) {
            if existing.selector == spec.selector {
                existing.update_from_spec(spec);
                return;
            }
            info!(vpa = %spec.id, "Selector changed, recreating vertical scaler");
            if let Err(e) = self.delete_vpa(&spec.id) {
                debug!(vpa = %spec.id, error = %e, "Failed to drop vertical scaler");
            }
        }

        let mut vpa = Vpa::new(spec);
        vpa.pod_count = self
            .pods
            .iter()
            .filter(|(id, pod)| vpa.matches_pod(&id.namespace, &pod.labels))
            .count();
        for (key, state) in self.aggregates.iter_mut() {
            if vpa.matches_key(key) {
                state.is_under_vpa = true;
            }
        }
        debug!(vpa = %spec.id, pods = vpa.pod_count, "Added vertical scaler");
        self.vpas.insert(spec.id.clone(), vpa);
    }

    pub fn delete_vpa(&mut self, id: &VpaId) -> Result<(), ModelError> {
        let vpa = self
            .vpas
            .remove(id)
            .ok_or_else(|| ModelError::ScalerNotFound(id.to_string()))?;
        for (key, state) in self.aggregates.iter_mut() {
            if vpa.matches_key(key) {
                state.is_under_vpa = self.vpas.values().any(|other| other.matches_key(key));
            }
        }
        Ok(())
    }

    /// Merges every aggregate a scaler selects by container name, together
    /// with the state loaded for it from checkpoints.
    pub fn aggregate_states_for_vpa(&self, id: &VpaId) -> BTreeMap<String, AggregateContainerState> {
        let mut merged: BTreeMap<String, AggregateContainerState> = BTreeMap::new();
        let Some(vpa) = self.vpas.get(id) else {
            return merged;
        };
        let now = Utc::now();

        for (key, state) in &self.aggregates {
            if !vpa.matches_key(key) {
                continue;
            }
            merged
                .entry(key.container.clone())
                .or_insert_with(|| AggregateContainerState::new(self.settings, now))
                .merge(state);
        }
        for (container, initial) in &vpa.initial_states {
            merged
                .entry(container.clone())
                .or_insert_with(|| AggregateContainerState::new(self.settings, now))
                .merge(initial);
        }
        merged
    }

    /// Removes aggregates that no active pod feeds and that are either
    /// empty or expired. Returns the number removed.
    pub fn garbage_collect(&mut self, now: DateTime<Utc>) -> usize {
        let contributive: HashSet<AggregateKey> = self
            .pods
            .iter()
            .filter(|(_, pod)| pod.phase.is_active())
            .flat_map(|(id, pod)| {
                pod.containers
                    .keys()
                    .map(move |container| Self::key_for(id, &pod.labels, container))
            })
            .collect();

        let before = self.aggregates.len();
        self.aggregates.retain(|key, state| {
            let keep = contributive.contains(key) || !(state.is_empty() || state.is_expired(now));
            if !keep {
                debug!(
                    namespace = %key.namespace,
                    container = %key.container,
                    "Removing aggregate container state"
                );
            }
            keep
        });
        before - self.aggregates.len()
    }

    /// Runs garbage collection if the last run is older than the GC interval.
    pub fn rate_limited_garbage_collect(&mut self, now: DateTime<Utc>) -> Option<usize> {
        if let Some(last) = self.last_gc {
            if now - last < self.gc_interval {
                return None;
            }
        }
        let removed = self.garbage_collect(now);
        self.last_gc = Some(now);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommender::vpa::UpdateMode;
    use chrono::Duration as ChronoDuration;

    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * MIB;

    fn cluster() -> ClusterState {
        ClusterState::new(AggregationSettings::default(), Duration::from_secs(3600))
    }

    fn labels(app: &str) -> Labels {
        [("app".to_string(), app.to_string())].into()
    }

    fn web_vpa() -> VpaSpec {
        VpaSpec {
            id: VpaId::new("default", "web"),
            selector: labels("web"),
            update_mode: UpdateMode::Auto,
            container_policies: HashMap::new(),
            created: Utc::now(),
        }
    }

    fn web_container(pod: &str) -> ContainerId {
        ContainerId::new(PodId::new("default", pod), "app")
    }

    fn with_pod(cluster: &mut ClusterState, pod: &str, app: &str) {
        cluster.add_or_update_pod(PodId::new("default", pod), labels(app), PodPhase::Running);
        cluster
            .add_or_update_container(&web_container(pod), Resources::new(1.0, GIB))
            .unwrap();
    }

    #[test]
    fn test_key_errors() {
        let mut cluster = cluster();
        let sample = UsageSample::cpu(Utc::now(), 0.5, 0.0);
        let err = cluster.add_sample(&web_container("missing"), &sample).unwrap_err();
        assert!(err.is_key_error());

        cluster.add_or_update_pod(PodId::new("default", "web-1"), labels("web"), PodPhase::Running);
        let err = cluster.add_sample(&web_container("web-1"), &sample).unwrap_err();
        assert!(matches!(err, ModelError::ContainerNotFound(_)));
        assert!(cluster
            .add_or_update_container(&web_container("nope"), Resources::default())
            .is_err());
        assert!(matches!(
            cluster.delete_vpa(&VpaId::new("default", "ghost")),
            Err(ModelError::ScalerNotFound(_))
        ));
    }

    #[test]
    fn test_samples_are_weighted_by_request() {
        let mut cluster = cluster();
        with_pod(&mut cluster, "web-1", "web");
        let now = Utc::now();
        cluster
            .add_sample(&web_container("web-1"), &UsageSample::cpu(now, 0.5, 0.0))
            .unwrap();

        let key = cluster.aggregate_key(&web_container("web-1")).unwrap();
        let aggregate = cluster.aggregate(&key).unwrap();
        assert_eq!(aggregate.total_samples(), 1);
        assert!(aggregate.cpu_histogram().total_weight() >= 0.5);
    }

    #[test]
    fn test_pods_with_same_labels_share_aggregate() {
        let mut cluster = cluster();
        with_pod(&mut cluster, "web-1", "web");
        with_pod(&mut cluster, "web-2", "web");
        with_pod(&mut cluster, "db-1", "db");
        assert_eq!(cluster.aggregate_count(), 2);
    }

    #[test]
    fn test_vpa_pod_counts_follow_labels() {
        let mut cluster = cluster();
        with_pod(&mut cluster, "web-1", "web");
        cluster.add_or_update_vpa(&web_vpa());
        let id = web_vpa().id;
        assert_eq!(cluster.vpa(&id).unwrap().pod_count, 1);

        with_pod(&mut cluster, "web-2", "web");
        assert_eq!(cluster.vpa(&id).unwrap().pod_count, 2);

        cluster.add_or_update_pod(PodId::new("default", "web-2"), labels("db"), PodPhase::Running);
        assert_eq!(cluster.vpa(&id).unwrap().pod_count, 1);

        cluster.delete_pod(&PodId::new("default", "web-1"));
        assert_eq!(cluster.vpa(&id).unwrap().pod_count, 0);
    }

    #[test]
    fn test_vpa_marks_aggregates() {
        let mut cluster = cluster();
        with_pod(&mut cluster, "web-1", "web");
        let key = cluster.aggregate_key(&web_container("web-1")).unwrap();
        assert!(!cluster.aggregate(&key).unwrap().is_under_vpa);

        cluster.add_or_update_vpa(&web_vpa());
        assert!(cluster.aggregate(&key).unwrap().is_under_vpa);

        cluster.delete_vpa(&web_vpa().id).unwrap();
        assert!(!cluster.aggregate(&key).unwrap().is_under_vpa);
    }

    #[test]
    fn test_oom_reaches_aggregate() {
        let mut cluster = cluster();
        with_pod(&mut cluster, "web-1", "web");
        cluster.add_or_update_vpa(&web_vpa());
        let now = Utc::now();
        cluster
            .add_sample(&web_container("web-1"), &UsageSample::memory(now, 900.0 * MIB))
            .unwrap();
        cluster.record_oom(&web_container("web-1"), now, GIB).unwrap();

        let states = cluster.aggregate_states_for_vpa(&web_vpa().id);
        assert!(states["app"].window_peak() >= 1.2 * GIB);
    }

    #[test]
    fn test_garbage_collection() {
        let mut cluster = cluster();
        with_pod(&mut cluster, "web-1", "web");
        with_pod(&mut cluster, "db-1", "db");
        let now = Utc::now();
        cluster
            .add_sample(&web_container("db-1"), &UsageSample::cpu(now, 0.1, 0.0))
            .unwrap();

        // Active pods keep their aggregates.
        assert_eq!(cluster.garbage_collect(now), 0);

        cluster.add_or_update_pod(PodId::new("default", "web-1"), labels("web"), PodPhase::Succeeded);
        cluster.delete_pod(&PodId::new("default", "db-1"));
        // The empty one goes right away, the one with samples only once expired.
        assert_eq!(cluster.garbage_collect(now), 1);
        assert_eq!(cluster.aggregate_count(), 1);
        assert_eq!(cluster.garbage_collect(now + ChronoDuration::days(9)), 1);
        assert_eq!(cluster.aggregate_count(), 0);
    }

    #[test]
    fn test_garbage_collection_is_rate_limited() {
        let mut cluster = cluster();
        let now = Utc::now();
        assert_eq!(cluster.rate_limited_garbage_collect(now), Some(0));
        assert_eq!(
            cluster.rate_limited_garbage_collect(now + ChronoDuration::minutes(30)),
            None
        );
        assert!(cluster
            .rate_limited_garbage_collect(now + ChronoDuration::minutes(61))
            .is_some());
    }

    #[test]
    fn test_selector_change_drops_initial_state() {
        let mut cluster = cluster();
        cluster.add_or_update_vpa(&web_vpa());
        let id = web_vpa().id;
        let state = AggregateContainerState::new(AggregationSettings::default(), Utc::now());
        cluster
            .vpa_mut(&id)
            .unwrap()
            .merge_checkpointed_state("app", state);

        cluster.add_or_update_vpa(&web_vpa());
        assert_eq!(cluster.vpa(&id).unwrap().initial_states.len(), 1);

        let mut changed = web_vpa();
        changed.selector = labels("web-v2");
        cluster.add_or_update_vpa(&changed);
        assert!(cluster.vpa(&id).unwrap().initial_states.is_empty());
    }
}
