//! Aggregated usage of a set of containers

use super::histogram::{DecayingHistogram, HistogramCheckpoint, HistogramOptions};
use super::{ResourceKind, UsageSample};
use crate::error::ModelError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tag of the checkpoint format this build reads and writes
pub const SUPPORTED_CHECKPOINT_VERSION: &str = "v3";

/// CPU samples weigh at least this much, even for containers without a request.
const MIN_SAMPLE_WEIGHT: f64 = 0.1;

/// Parameters shared by every aggregate of a model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationSettings {
    /// Length of one memory window; one peak is recorded per window
    pub memory_aggregation_interval: Duration,
    /// Number of windows in the aggregation lifetime
    pub memory_aggregation_interval_count: u32,
    pub cpu_half_life: Duration,
    pub memory_half_life: Duration,
    pub oom_bump_up_ratio: f64,
    pub oom_min_bump_up_bytes: f64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            memory_aggregation_interval: Duration::from_secs(24 * 3600),
            memory_aggregation_interval_count: 8,
            cpu_half_life: Duration::from_secs(24 * 3600),
            memory_half_life: Duration::from_secs(24 * 3600),
            oom_bump_up_ratio: 1.2,
            oom_min_bump_up_bytes: 100.0 * 1024.0 * 1024.0,
        }
    }
}

impl AggregationSettings {
    /// Time after the last sample at which an aggregate is considered stale
    pub fn aggregation_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.memory_aggregation_interval.as_secs() as i64
                * self.memory_aggregation_interval_count as i64,
        )
    }

    fn interval_secs(&self) -> i64 {
        (self.memory_aggregation_interval.as_secs() as i64).max(1)
    }

    /// End of the epoch-aligned window containing `time`
    pub fn window_end(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval_secs();
        let end = (time.timestamp().div_euclid(interval) + 1) * interval;
        Utc.timestamp_opt(end, 0).single().unwrap_or(time)
    }

    fn window_start(&self, end: DateTime<Utc>) -> DateTime<Utc> {
        end - chrono::Duration::seconds(self.interval_secs())
    }
}

/// Serialised aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCheckpoint {
    pub version: String,
    pub cpu_histogram: HistogramCheckpoint,
    pub memory_histogram: HistogramCheckpoint,
    pub first_sample_start: Option<DateTime<Utc>>,
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
    /// End of the memory window the peak belongs to
    pub window_end: Option<DateTime<Utc>>,
    /// Peak of the in-progress memory window, in bytes
    pub last_window_peak: f64,
}

/// Usage histograms and metadata of all containers sharing an aggregate key
///
/// First/last sample times and the sample count track CPU samples only.
#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    cpu: DecayingHistogram,
    memory: DecayingHistogram,
    first_sample_start: Option<DateTime<Utc>>,
    last_sample_start: Option<DateTime<Utc>>,
    total_samples: u64,
    creation_time: DateTime<Utc>,
    window_end: Option<DateTime<Utc>>,
    window_peak: f64,
    settings: AggregationSettings,
    /// Whether a vertical scaler currently selects this aggregate
    pub is_under_vpa: bool,
}

impl AggregateContainerState {
    pub fn new(settings: AggregationSettings, now: DateTime<Utc>) -> Self {
        Self {
            cpu: DecayingHistogram::new(HistogramOptions::cpu(), settings.cpu_half_life),
            memory: DecayingHistogram::new(HistogramOptions::memory(), settings.memory_half_life),
            first_sample_start: None,
            last_sample_start: None,
            total_samples: 0,
            creation_time: now,
            window_end: None,
            window_peak: 0.0,
            settings,
            is_under_vpa: false,
        }
    }

    pub fn from_checkpoint(
        settings: AggregationSettings,
        checkpoint: &AggregateCheckpoint,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let mut state = Self::new(settings, now);
        state.load_from_checkpoint(checkpoint)?;
        Ok(state)
    }

    pub fn cpu_histogram(&self) -> &DecayingHistogram {
        &self.cpu
    }

    /// Memory peaks of completed windows
    pub fn memory_histogram(&self) -> &DecayingHistogram {
        &self.memory
    }

    /// Memory peaks including the peak of the window in progress
    pub fn memory_histogram_with_peak(&self) -> DecayingHistogram {
        let mut histogram = self.memory.clone();
        if let Some(end) = self.window_end {
            if self.window_peak > 0.0 {
                histogram.add_sample(self.window_peak, 1.0, self.settings.window_start(end));
            }
        }
        histogram
    }

    pub fn first_sample_start(&self) -> Option<DateTime<Utc>> {
        self.first_sample_start
    }

    pub fn last_sample_start(&self) -> Option<DateTime<Utc>> {
        self.last_sample_start
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn window_peak(&self) -> f64 {
        self.window_peak
    }

    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        self.window_end
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    /// True when no CPU sample arrived for the whole aggregation lifetime,
    /// or, for an empty aggregate, when it was created that long ago.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let since = match self.last_sample_start {
            Some(last) if !self.is_empty() => last,
            _ => self.creation_time,
        };
        now - since >= self.settings.aggregation_lifetime()
    }

    pub fn add_sample(&mut self, sample: &UsageSample) -> Result<(), ModelError> {
        if sample.usage < 0.0 || !sample.usage.is_finite() {
            return Err(ModelError::SampleDiscarded(format!(
                "invalid usage {}",
                sample.usage
            )));
        }
        match sample.resource {
            ResourceKind::Cpu => {
                self.add_cpu_sample(sample);
                Ok(())
            }
            ResourceKind::Memory => self.add_memory_sample(sample.measure_start, sample.usage),
        }
    }

    fn add_cpu_sample(&mut self, sample: &UsageSample) {
        // Weighting by request makes history decay faster after the request grows.
        let weight = sample.request.max(MIN_SAMPLE_WEIGHT);
        self.cpu.add_sample(sample.usage, weight, sample.measure_start);

        if self.last_sample_start.map_or(true, |last| sample.measure_start > last) {
            self.last_sample_start = Some(sample.measure_start);
        }
        if self.first_sample_start.map_or(true, |first| sample.measure_start < first) {
            self.first_sample_start = Some(sample.measure_start);
        }
        self.total_samples += 1;
    }

    /// Moves to the window containing `time`. Returns false if `time` lies
    /// before the current window.
    fn advance_window(&mut self, time: DateTime<Utc>) -> bool {
        let Some(end) = self.window_end else {
            self.window_end = Some(self.settings.window_end(time));
            return true;
        };
        if time < self.settings.window_start(end) {
            return false;
        }
        if time >= end {
            if self.window_peak > 0.0 {
                self.memory
                    .add_sample(self.window_peak, 1.0, self.settings.window_start(end));
            }
            self.window_peak = 0.0;
            self.window_end = Some(self.settings.window_end(time));
        }
        true
    }

    fn add_memory_sample(&mut self, time: DateTime<Utc>, usage: f64) -> Result<(), ModelError> {
        if !self.advance_window(time) {
            return Err(ModelError::SampleDiscarded(
                "memory sample older than the current window".into(),
            ));
        }
        self.window_peak = self.window_peak.max(usage);
        Ok(())
    }

    /// Raises the peak of the current window after an out-of-memory kill.
    pub fn record_oom(&mut self, time: DateTime<Utc>, requested_memory: f64) -> Result<(), ModelError> {
        if !self.advance_window(time) {
            return Err(ModelError::OomDiscarded(
                "event older than the current window".into(),
            ));
        }
        let used = requested_memory.max(self.window_peak);
        let needed = (used * self.settings.oom_bump_up_ratio)
            .max(used + self.settings.oom_min_bump_up_bytes);
        self.window_peak = self.window_peak.max(needed);
        Ok(())
    }

    pub fn merge(&mut self, other: &AggregateContainerState) {
        self.cpu.merge(&other.cpu);
        self.memory.merge(&other.memory);

        if let Some(other_first) = other.first_sample_start {
            if self.first_sample_start.map_or(true, |first| other_first < first) {
                self.first_sample_start = Some(other_first);
            }
        }
        if let Some(other_last) = other.last_sample_start {
            if self.last_sample_start.map_or(true, |last| other_last > last) {
                self.last_sample_start = Some(other_last);
            }
        }
        self.total_samples += other.total_samples;

        match (self.window_end, other.window_end) {
            (_, None) => {}
            (None, Some(_)) => {
                self.window_end = other.window_end;
                self.window_peak = other.window_peak;
            }
            (Some(mine), Some(theirs)) if theirs > mine => {
                // Our in-progress window is over from the merged point of view.
                if self.window_peak > 0.0 {
                    self.memory
                        .add_sample(self.window_peak, 1.0, self.settings.window_start(mine));
                }
                self.window_end = other.window_end;
                self.window_peak = other.window_peak;
            }
            (Some(mine), Some(theirs)) if theirs < mine => {
                if other.window_peak > 0.0 {
                    self.memory
                        .add_sample(other.window_peak, 1.0, self.settings.window_start(theirs));
                }
            }
            (Some(_), Some(_)) => {
                self.window_peak = self.window_peak.max(other.window_peak);
            }
        }
    }

    pub fn save_to_checkpoint(&self) -> AggregateCheckpoint {
        AggregateCheckpoint {
            version: SUPPORTED_CHECKPOINT_VERSION.to_string(),
            cpu_histogram: self.cpu.save_to_checkpoint(),
            memory_histogram: self.memory.save_to_checkpoint(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples,
            window_end: self.window_end,
            last_window_peak: self.window_peak,
        }
    }

    pub fn load_from_checkpoint(&mut self, checkpoint: &AggregateCheckpoint) -> Result<(), ModelError> {
        if checkpoint.version != SUPPORTED_CHECKPOINT_VERSION {
            return Err(ModelError::CheckpointVersion(checkpoint.version.clone()));
        }
        if checkpoint.last_window_peak < 0.0 || !checkpoint.last_window_peak.is_finite() {
            return Err(ModelError::InvalidCheckpoint(format!(
                "invalid window peak {}",
                checkpoint.last_window_peak
            )));
        }
        self.cpu.load_from_checkpoint(&checkpoint.cpu_histogram)?;
        self.memory.load_from_checkpoint(&checkpoint.memory_histogram)?;
        self.first_sample_start = checkpoint.first_sample_start;
        self.last_sample_start = checkpoint.last_sample_start;
        self.total_samples = checkpoint.total_samples_count;
        self.window_end = checkpoint.window_end;
        self.window_peak = checkpoint.last_window_peak;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * MIB;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    }

    fn state() -> AggregateContainerState {
        AggregateContainerState::new(AggregationSettings::default(), start())
    }

    #[test]
    fn test_window_end_is_epoch_aligned() {
        let settings = AggregationSettings::default();
        assert_eq!(
            settings.window_end(start()),
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
        );
        assert_eq!(
            settings.window_end(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()),
            Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_oom_bumps_window_peak() {
        let mut aggregate = state();
        for minute in 0..30 {
            let time = start() + ChronoDuration::minutes(minute);
            aggregate
                .add_sample(&UsageSample::memory(time, 850.0 * MIB + minute as f64 * MIB))
                .unwrap();
        }
        assert!(aggregate.window_peak() < 900.0 * MIB);

        aggregate
            .record_oom(start() + ChronoDuration::minutes(31), GIB)
            .unwrap();

        let checkpoint = aggregate.save_to_checkpoint();
        assert!(checkpoint.last_window_peak >= 1.2 * GIB);
    }

    #[test]
    fn test_oom_minimum_bump_for_small_requests() {
        let mut aggregate = state();
        aggregate.record_oom(start(), 100.0 * MIB).unwrap();
        // 1.2 x 100 MiB is less than 100 MiB + 100 MiB.
        assert_eq!(aggregate.window_peak(), 200.0 * MIB);
    }

    #[test]
    fn test_window_rollover_records_peak() {
        let mut aggregate = state();
        aggregate
            .add_sample(&UsageSample::memory(start(), 300.0 * MIB))
            .unwrap();
        aggregate
            .add_sample(&UsageSample::memory(start() + ChronoDuration::hours(1), 500.0 * MIB))
            .unwrap();
        assert!(aggregate.memory_histogram().is_empty());

        let next_day = start() + ChronoDuration::days(1);
        aggregate
            .add_sample(&UsageSample::memory(next_day, 100.0 * MIB))
            .unwrap();

        assert!(!aggregate.memory_histogram().is_empty());
        assert_eq!(aggregate.window_peak(), 100.0 * MIB);
        assert!(aggregate.memory_histogram().percentile(1.0) >= 500.0 * MIB);
    }

    #[test]
    fn test_samples_before_current_window_are_discarded() {
        let mut aggregate = state();
        let next_day = start() + ChronoDuration::days(1);
        aggregate
            .add_sample(&UsageSample::memory(next_day, 100.0 * MIB))
            .unwrap();

        assert!(matches!(
            aggregate.add_sample(&UsageSample::memory(start(), 100.0 * MIB)),
            Err(ModelError::SampleDiscarded(_))
        ));
        assert!(matches!(
            aggregate.record_oom(start(), GIB),
            Err(ModelError::OomDiscarded(_))
        ));
    }

    #[test]
    fn test_cpu_samples_track_times_and_count() {
        let mut aggregate = state();
        let later = start() + ChronoDuration::minutes(5);
        aggregate.add_sample(&UsageSample::cpu(later, 0.5, 1.0)).unwrap();
        aggregate.add_sample(&UsageSample::cpu(start(), 0.4, 1.0)).unwrap();
        aggregate
            .add_sample(&UsageSample::memory(start(), 10.0 * MIB))
            .unwrap();

        assert_eq!(aggregate.total_samples(), 2);
        assert_eq!(aggregate.first_sample_start(), Some(start()));
        assert_eq!(aggregate.last_sample_start(), Some(later));
        assert!(aggregate
            .add_sample(&UsageSample::cpu(start(), -1.0, 1.0))
            .is_err());
    }

    #[test]
    fn test_expiry() {
        let mut aggregate = state();
        let lifetime = AggregationSettings::default().aggregation_lifetime();
        assert!(!aggregate.is_expired(start() + ChronoDuration::days(1)));
        assert!(aggregate.is_expired(start() + lifetime));

        let sample_time = start() + ChronoDuration::days(3);
        aggregate.add_sample(&UsageSample::cpu(sample_time, 0.1, 0.1)).unwrap();
        assert!(!aggregate.is_expired(start() + lifetime));
        assert!(aggregate.is_expired(sample_time + lifetime));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut aggregate = state();
        for minute in 0..3000 {
            let time = start() + ChronoDuration::minutes(minute);
            let wave = (minute % 60) as f64 / 60.0;
            aggregate
                .add_sample(&UsageSample::cpu(time, 0.2 + wave, 0.5))
                .unwrap();
            aggregate
                .add_sample(&UsageSample::memory(time, 200.0 * MIB + wave * 300.0 * MIB))
                .unwrap();
        }

        let checkpoint = aggregate.save_to_checkpoint();
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored = AggregateContainerState::from_checkpoint(
            AggregationSettings::default(),
            &serde_json::from_str(&json).unwrap(),
            start(),
        )
        .unwrap();

        let restored_checkpoint = restored.save_to_checkpoint();
        for (bucket, weight) in &checkpoint.cpu_histogram.buckets {
            let other = restored_checkpoint.cpu_histogram.buckets[bucket];
            assert!((other - weight).abs() <= 1e-9 * weight.max(1.0));
        }
        for p in [0.5, 0.9, 0.95] {
            assert_eq!(
                restored.cpu_histogram().percentile(p),
                aggregate.cpu_histogram().percentile(p)
            );
            assert_eq!(
                restored.memory_histogram_with_peak().percentile(p),
                aggregate.memory_histogram_with_peak().percentile(p)
            );
        }
        assert_eq!(restored.total_samples(), 3000);
        assert_eq!(restored.window_peak(), aggregate.window_peak());
    }

    #[test]
    fn test_checkpoint_version_is_checked() {
        let mut checkpoint = state().save_to_checkpoint();
        checkpoint.version = "v2".into();
        assert_eq!(
            AggregateContainerState::from_checkpoint(AggregationSettings::default(), &checkpoint, start())
                .unwrap_err(),
            ModelError::CheckpointVersion("v2".into())
        );
    }

    #[test]
    fn test_merge_combines_counts_and_peaks() {
        let mut a = state();
        a.add_sample(&UsageSample::cpu(start(), 0.5, 1.0)).unwrap();
        a.add_sample(&UsageSample::memory(start(), 100.0 * MIB)).unwrap();

        let mut b = state();
        let later = start() + ChronoDuration::minutes(10);
        b.add_sample(&UsageSample::cpu(later, 1.5, 1.0)).unwrap();
        b.add_sample(&UsageSample::memory(later, 300.0 * MIB)).unwrap();

        a.merge(&b);
        assert_eq!(a.total_samples(), 2);
        assert_eq!(a.first_sample_start(), Some(start()));
        assert_eq!(a.last_sample_start(), Some(later));
        assert_eq!(a.window_peak(), 300.0 * MIB);
    }
}
