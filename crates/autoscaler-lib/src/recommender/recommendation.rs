//! Resource recommendations computed from aggregated usage

use super::aggregate::AggregateContainerState;
use super::config::RecommenderConfig;
use super::vpa::{ContainerPolicy, Vpa};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lower confidence values would make the upper bound unbounded.
const MIN_CONFIDENCE: f64 = 0.001;

/// CPU in cores and memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: f64,
}

impl Resources {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory }
    }

    fn max(self, other: Resources) -> Resources {
        Resources::new(self.cpu.max(other.cpu), self.memory.max(other.memory))
    }

    fn scale(self, factor: f64) -> Resources {
        Resources::new(self.cpu * factor, self.memory * factor)
    }

    fn clamp(self, policy: Option<&ContainerPolicy>) -> Resources {
        let Some(policy) = policy else {
            return self;
        };
        let mut clamped = self;
        if let Some(min) = policy.min_allowed {
            clamped = clamped.max(min);
        }
        if let Some(max) = policy.max_allowed {
            clamped.cpu = clamped.cpu.min(max.cpu);
            clamped.memory = clamped.memory.min(max.memory);
        }
        clamped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecommendedContainerResources {
    pub target: Resources,
    pub lower_bound: Resources,
    pub upper_bound: Resources,
    /// Target before policy limits were applied
    pub uncapped_target: Resources,
}

/// Turns aggregated usage into per-container requests.
#[derive(Debug, Clone)]
pub struct ResourceRecommender {
    target_cpu_percentile: f64,
    lower_bound_cpu_percentile: f64,
    upper_bound_cpu_percentile: f64,
    target_memory_percentile: f64,
    lower_bound_memory_percentile: f64,
    upper_bound_memory_percentile: f64,
    safety_margin_fraction: f64,
    pod_min_cpu_cores: f64,
    pod_min_memory_bytes: f64,
}

impl ResourceRecommender {
    pub fn new(config: &RecommenderConfig) -> Self {
        Self {
            target_cpu_percentile: config.target_cpu_percentile,
            lower_bound_cpu_percentile: config.lower_bound_cpu_percentile,
            upper_bound_cpu_percentile: config.upper_bound_cpu_percentile,
            target_memory_percentile: config.target_memory_percentile,
            lower_bound_memory_percentile: config.lower_bound_memory_percentile,
            upper_bound_memory_percentile: config.upper_bound_memory_percentile,
            safety_margin_fraction: config.safety_margin_fraction,
            pod_min_cpu_cores: config.pod_min_cpu_millicores / 1000.0,
            pod_min_memory_bytes: config.pod_min_memory_mb * 1024.0 * 1024.0,
        }
    }

    /// Confidence grows with both the observed lifespan in days and the
    /// number of samples, at one sample per minute.
    fn confidence(state: &AggregateContainerState) -> f64 {
        let lifespan_days = match (state.first_sample_start(), state.last_sample_start()) {
            (Some(first), Some(last)) => (last - first).num_seconds() as f64 / 86_400.0,
            _ => 0.0,
        };
        let samples_days = state.total_samples() as f64 / (60.0 * 24.0);
        lifespan_days.min(samples_days).max(MIN_CONFIDENCE)
    }

    fn percentiles(&self, state: &AggregateContainerState, cpu: f64, memory: f64) -> Resources {
        Resources::new(
            state.cpu_histogram().percentile(cpu),
            state.memory_histogram_with_peak().percentile(memory),
        )
    }

    /// Recommendation for one container. `containers` is the number of
    /// containers sharing the pod minimum.
    pub fn recommend(
        &self,
        state: &AggregateContainerState,
        policy: Option<&ContainerPolicy>,
        containers: usize,
    ) -> RecommendedContainerResources {
        let margin = 1.0 + self.safety_margin_fraction;
        let confidence = Self::confidence(state);
        let share = containers.max(1) as f64;
        let minimum = Resources::new(self.pod_min_cpu_cores / share, self.pod_min_memory_bytes / share);

        let target = self
            .percentiles(state, self.target_cpu_percentile, self.target_memory_percentile)
            .scale(margin)
            .max(minimum);
        let lower_bound = self
            .percentiles(
                state,
                self.lower_bound_cpu_percentile,
                self.lower_bound_memory_percentile,
            )
            .scale(margin)
            .scale((1.0 + 0.001 / confidence).powi(-2))
            .max(minimum);
        let upper_bound = self
            .percentiles(
                state,
                self.upper_bound_cpu_percentile,
                self.upper_bound_memory_percentile,
            )
            .scale(margin)
            .scale(1.0 + 1.0 / confidence)
            .max(minimum);

        RecommendedContainerResources {
            target: target.clamp(policy),
            lower_bound: lower_bound.clamp(policy),
            upper_bound: upper_bound.clamp(policy),
            uncapped_target: target,
        }
    }

    /// Recommendations for every container of a scaler that is not disabled.
    pub fn recommend_for_vpa(
        &self,
        vpa: &Vpa,
        states: &BTreeMap<String, AggregateContainerState>,
    ) -> BTreeMap<String, RecommendedContainerResources> {
        let enabled: Vec<_> = states
            .iter()
            .filter(|(container, _)| !vpa.is_disabled(container))
            .collect();
        let count = enabled.len();
        enabled
            .into_iter()
            .map(|(container, state)| {
                (
                    container.clone(),
                    self.recommend(state, vpa.policy(container), count),
                )
            })
            .collect()
    }
}
