//! Recommender configuration

use super::aggregate::AggregationSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// All recommender options in one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// How often metrics are fetched and recommendations recomputed
    pub metrics_fetcher_interval_secs: u64,
    /// How often orphaned checkpoints are garbage collected
    pub checkpoints_gc_interval_secs: u64,
    /// Time budget for writing checkpoints in one iteration
    pub checkpoints_write_timeout_secs: u64,
    /// How often in-memory aggregates are garbage collected
    pub aggregate_gc_interval_secs: u64,

    pub memory_aggregation_interval_secs: u64,
    pub memory_aggregation_interval_count: u32,
    pub cpu_histogram_decay_half_life_secs: u64,
    pub memory_histogram_decay_half_life_secs: u64,

    pub oom_bump_up_ratio: f64,
    pub oom_min_bump_up_bytes: f64,

    pub target_cpu_percentile: f64,
    pub lower_bound_cpu_percentile: f64,
    pub upper_bound_cpu_percentile: f64,
    pub target_memory_percentile: f64,
    pub lower_bound_memory_percentile: f64,
    pub upper_bound_memory_percentile: f64,
    pub safety_margin_fraction: f64,
    pub pod_min_cpu_millicores: f64,
    pub pod_min_memory_mb: f64,

    /// Only track pods selected by a vertical scaler
    pub memory_saver: bool,
    /// Restrict the recommender to scalers in this namespace
    pub vpa_object_namespace: Option<String>,
    /// Namespaces whose scalers and pods are ignored
    pub ignored_namespaces: Vec<String>,

    pub checkpoint_dir: PathBuf,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            metrics_fetcher_interval_secs: 60,
            checkpoints_gc_interval_secs: 600,
            checkpoints_write_timeout_secs: 60,
            aggregate_gc_interval_secs: 3600,
            memory_aggregation_interval_secs: 24 * 3600,
            memory_aggregation_interval_count: 8,
            cpu_histogram_decay_half_life_secs: 24 * 3600,
            memory_histogram_decay_half_life_secs: 24 * 3600,
            oom_bump_up_ratio: 1.2,
            oom_min_bump_up_bytes: 100.0 * 1024.0 * 1024.0,
            target_cpu_percentile: 0.9,
            lower_bound_cpu_percentile: 0.5,
            upper_bound_cpu_percentile: 0.95,
            target_memory_percentile: 0.9,
            lower_bound_memory_percentile: 0.5,
            upper_bound_memory_percentile: 0.95,
            safety_margin_fraction: 0.15,
            pod_min_cpu_millicores: 25.0,
            pod_min_memory_mb: 250.0,
            memory_saver: false,
            vpa_object_namespace: None,
            ignored_namespaces: Vec::new(),
            checkpoint_dir: PathBuf::from("/var/lib/node-autoscaler/checkpoints"),
        }
    }
}

impl RecommenderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vpa_object_namespace.is_some() && !self.ignored_namespaces.is_empty() {
            anyhow::bail!("vpa_object_namespace and ignored_namespaces are mutually exclusive");
        }
        if self.oom_bump_up_ratio < 1.0 {
            anyhow::bail!("oom_bump_up_ratio must be >= 1, got {}", self.oom_bump_up_ratio);
        }
        if self.oom_min_bump_up_bytes < 0.0 {
            anyhow::bail!("oom_min_bump_up_bytes must not be negative");
        }
        let percentiles = [
            self.target_cpu_percentile,
            self.lower_bound_cpu_percentile,
            self.upper_bound_cpu_percentile,
            self.target_memory_percentile,
            self.lower_bound_memory_percentile,
            self.upper_bound_memory_percentile,
        ];
        if percentiles.iter().any(|p| !(0.0..=1.0).contains(p)) {
            anyhow::bail!("percentiles must be within [0, 1]");
        }
        if self.memory_aggregation_interval_secs == 0 || self.memory_aggregation_interval_count == 0 {
            anyhow::bail!("memory aggregation interval and count must be positive");
        }
        if self.cpu_histogram_decay_half_life_secs == 0 || self.memory_histogram_decay_half_life_secs == 0 {
            anyhow::bail!("histogram half-lives must be positive");
        }
        Ok(())
    }

    pub fn aggregation_settings(&self) -> AggregationSettings {
        AggregationSettings {
            memory_aggregation_interval: Duration::from_secs(self.memory_aggregation_interval_secs),
            memory_aggregation_interval_count: self.memory_aggregation_interval_count,
            cpu_half_life: Duration::from_secs(self.cpu_histogram_decay_half_life_secs),
            memory_half_life: Duration::from_secs(self.memory_histogram_decay_half_life_secs),
            oom_bump_up_ratio: self.oom_bump_up_ratio,
            oom_min_bump_up_bytes: self.oom_min_bump_up_bytes,
        }
    }

    /// Whether scalers and pods of a namespace are in scope
    pub fn namespace_in_scope(&self, namespace: &str) -> bool {
        match &self.vpa_object_namespace {
            Some(only) => only == namespace,
            None => !self.ignored_namespaces.iter().any(|n| n == namespace),
        }
    }

    pub fn metrics_fetcher_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_fetcher_interval_secs)
    }

    pub fn checkpoints_gc_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoints_gc_interval_secs)
    }

    pub fn checkpoints_write_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoints_write_timeout_secs)
    }

    pub fn aggregate_gc_interval(&self) -> Duration {
        Duration::from_secs(self.aggregate_gc_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RecommenderConfig::default();
        assert!(config.validate().is_ok());
        let settings = config.aggregation_settings();
        assert_eq!(settings.aggregation_lifetime(), chrono::Duration::days(8));
        assert_eq!(settings.oom_bump_up_ratio, 1.2);
    }

    #[test]
    fn test_namespace_options_are_exclusive() {
        let config = RecommenderConfig {
            vpa_object_namespace: Some("prod".into()),
            ignored_namespaces: vec!["kube-system".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_namespace_scope() {
        let only = RecommenderConfig {
            vpa_object_namespace: Some("prod".into()),
            ..Default::default()
        };
        assert!(only.namespace_in_scope("prod"));
        assert!(!only.namespace_in_scope("dev"));

        let ignoring = RecommenderConfig {
            ignored_namespaces: vec!["kube-system".into()],
            ..Default::default()
        };
        assert!(ignoring.namespace_in_scope("prod"));
        assert!(!ignoring.namespace_in_scope("kube-system"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RecommenderConfig =
            serde_json::from_str(r#"{"memory_saver": true, "safety_margin_fraction": 0.2}"#).unwrap();
        assert!(config.memory_saver);
        assert_eq!(config.safety_margin_fraction, 0.2);
        assert_eq!(config.target_cpu_percentile, 0.9);
    }
}
