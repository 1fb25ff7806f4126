//! Observability infrastructure for the autoscaler
//!
//! Provides:
//! - Prometheus metrics (node-group sizes, scale operations, provider errors,
//!   refresh latency, recommender state)
//! - Structured event logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for provider round-trips and refreshes (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AutoscalerMetricsInner> = OnceLock::new();

struct AutoscalerMetricsInner {
    node_group_target_size: IntGaugeVec,
    node_group_min_size: IntGaugeVec,
    node_group_max_size: IntGaugeVec,
    scale_up_nodes: IntCounterVec,
    scale_down_nodes: IntCounterVec,
    provider_errors: IntCounterVec,
    refresh_latency_seconds: Histogram,
    aggregate_container_states: IntGauge,
    checkpoints_written: IntCounter,
    checkpoints_failed: IntCounter,
}

impl AutoscalerMetricsInner {
    fn new() -> Self {
        Self {
            node_group_target_size: register_int_gauge_vec!(
                "node_autoscaler_node_group_target_size",
                "Target size of each registered node group",
                &["node_group"]
            )
            .expect("Failed to register node_group_target_size"),

            node_group_min_size: register_int_gauge_vec!(
                "node_autoscaler_node_group_min_size",
                "Minimum size of each registered node group",
                &["node_group"]
            )
            .expect("Failed to register node_group_min_size"),

            node_group_max_size: register_int_gauge_vec!(
                "node_autoscaler_node_group_max_size",
                "Maximum size of each registered node group",
                &["node_group"]
            )
            .expect("Failed to register node_group_max_size"),

            scale_up_nodes: register_int_counter_vec!(
                "node_autoscaler_scale_up_nodes_total",
                "Nodes requested by successful scale-ups",
                &["node_group"]
            )
            .expect("Failed to register scale_up_nodes"),

            scale_down_nodes: register_int_counter_vec!(
                "node_autoscaler_scale_down_nodes_total",
                "Nodes removed by successful scale-downs",
                &["node_group"]
            )
            .expect("Failed to register scale_down_nodes"),

            provider_errors: register_int_counter_vec!(
                "node_autoscaler_provider_errors_total",
                "Failed provider operations by operation and error kind",
                &["operation", "kind"]
            )
            .expect("Failed to register provider_errors"),

            refresh_latency_seconds: register_histogram!(
                "node_autoscaler_refresh_latency_seconds",
                "Time spent refreshing node groups from the provider",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register refresh_latency_seconds"),

            aggregate_container_states: register_int_gauge!(
                "node_autoscaler_aggregate_container_states",
                "Aggregate container states held by the recommender"
            )
            .expect("Failed to register aggregate_container_states"),

            checkpoints_written: register_int_counter!(
                "node_autoscaler_checkpoints_written_total",
                "Recommender checkpoints written"
            )
            .expect("Failed to register checkpoints_written"),

            checkpoints_failed: register_int_counter!(
                "node_autoscaler_checkpoints_failed_total",
                "Recommender checkpoint writes that failed"
            )
            .expect("Failed to register checkpoints_failed"),
        }
    }
}

/// Handle to the process-wide autoscaler metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    inner: &'static AutoscalerMetricsInner,
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscalerMetrics {
    /// Create a metrics handle, registering the metrics on first call
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new),
        }
    }

    pub fn set_node_group_sizes(&self, node_group: &str, min: i64, max: i64, target: i64) {
        self.inner
            .node_group_min_size
            .with_label_values(&[node_group])
            .set(min);
        self.inner
            .node_group_max_size
            .with_label_values(&[node_group])
            .set(max);
        self.inner
            .node_group_target_size
            .with_label_values(&[node_group])
            .set(target);
    }

    /// Drop the size series of a group that is no longer registered
    pub fn remove_node_group(&self, node_group: &str) {
        let _ = self.inner.node_group_min_size.remove_label_values(&[node_group]);
        let _ = self.inner.node_group_max_size.remove_label_values(&[node_group]);
        let _ = self.inner.node_group_target_size.remove_label_values(&[node_group]);
    }

    pub fn record_scale_up(&self, node_group: &str, nodes: u64) {
        self.inner
            .scale_up_nodes
            .with_label_values(&[node_group])
            .inc_by(nodes);
    }

    pub fn record_scale_down(&self, node_group: &str, nodes: u64) {
        self.inner
            .scale_down_nodes
            .with_label_values(&[node_group])
            .inc_by(nodes);
    }

    pub fn inc_provider_errors(&self, operation: &str, kind: &str) {
        self.inner
            .provider_errors
            .with_label_values(&[operation, kind])
            .inc();
    }

    pub fn observe_refresh_latency(&self, duration_secs: f64) {
        self.inner.refresh_latency_seconds.observe(duration_secs);
    }

    pub fn set_aggregate_container_states(&self, count: i64) {
        self.inner.aggregate_container_states.set(count);
    }

    pub fn record_checkpoints(&self, written: u64, failed: u64) {
        self.inner.checkpoints_written.inc_by(written);
        self.inner.checkpoints_failed.inc_by(failed);
    }
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

/// Structured logger for autoscaler events
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_scale_up(&self, node_group: &str, delta: i64, target: i64) {
        info!(
            event = "scale_up",
            cluster = %self.cluster,
            node_group = %node_group,
            delta = delta,
            target_size = target,
            "Increased node group size"
        );
    }

    pub fn log_scale_down(&self, node_group: &str, nodes: &[String], target: i64) {
        info!(
            event = "scale_down",
            cluster = %self.cluster,
            node_group = %node_group,
            nodes = ?nodes,
            target_size = target,
            "Deleted nodes from node group"
        );
    }

    pub fn log_node_groups_discovered(&self, node_groups: &[String]) {
        info!(
            event = "node_groups_discovered",
            cluster = %self.cluster,
            node_groups = ?node_groups,
            "Registered node groups"
        );
    }

    pub fn log_node_groups_dropped(&self, node_groups: &[String]) {
        warn!(
            event = "node_groups_dropped",
            cluster = %self.cluster,
            node_groups = ?node_groups,
            "Node groups no longer discovered"
        );
    }

    pub fn log_checkpoints_written(&self, written: usize, failed: usize, deferred: usize) {
        if failed > 0 {
            warn!(
                event = "checkpoints_written",
                cluster = %self.cluster,
                written = written,
                failed = failed,
                deferred = deferred,
                "Some recommender checkpoints failed to write"
            );
        } else {
            info!(
                event = "checkpoints_written",
                cluster = %self.cluster,
                written = written,
                deferred = deferred,
                "Wrote recommender checkpoints"
            );
        }
    }

    pub fn log_startup(&self, version: &str, provider: &str) {
        info!(
            event = "autoscaler_started",
            cluster = %self.cluster,
            version = %version,
            provider = %provider,
            "Node autoscaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Node autoscaler shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let metrics = AutoscalerMetrics::new();
        metrics.set_node_group_sizes("metrics-test", 1, 10, 3);
        metrics.record_scale_up("metrics-test", 2);
        metrics.record_scale_down("metrics-test", 1);
        metrics.inc_provider_errors("increase_size", "unavailable");
        metrics.observe_refresh_latency(0.2);
        metrics.set_aggregate_container_states(4);
        metrics.record_checkpoints(3, 0);

        let text = String::from_utf8(gather_text().unwrap()).unwrap();
        assert!(text.contains("node_autoscaler_node_group_target_size{node_group=\"metrics-test\"} 3"));
        assert!(text.contains("node_autoscaler_provider_errors_total"));
    }

    #[test]
    fn test_handles_share_registration() {
        let first = AutoscalerMetrics::new();
        let second = AutoscalerMetrics::default();
        first.set_node_group_sizes("shared", 0, 5, 2);
        second.remove_node_group("shared");
        let text = String::from_utf8(gather_text().unwrap()).unwrap();
        assert!(!text.contains("node_group=\"shared\""));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-cluster");
        assert_eq!(logger.cluster, "test-cluster");
    }
}
