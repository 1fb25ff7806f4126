//! Exponential-bucket histograms with exponentially decaying sample weights

use crate::error::ModelError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Samples may be at most this many half-lives ahead of the reference time
/// before all weights are rescaled.
const MAX_DECAY_EXPONENT: f64 = 100.0;

/// Bucket layout: the first bucket has width `first_bucket_size` and each
/// following bucket is `ratio` times wider than the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramOptions {
    num_buckets: usize,
    first_bucket_size: f64,
    ratio: f64,
    epsilon: f64,
}

impl HistogramOptions {
    pub fn exponential(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> Result<Self, ModelError> {
        if max_value <= 0.0 || first_bucket_size <= 0.0 || ratio <= 1.0 || epsilon <= 0.0 {
            return Err(ModelError::InvalidCheckpoint(format!(
                "invalid histogram options: max={} first={} ratio={} epsilon={}",
                max_value, first_bucket_size, ratio, epsilon
            )));
        }
        Ok(Self::build(max_value, first_bucket_size, ratio, epsilon))
    }

    fn build(max_value: f64, first_bucket_size: f64, ratio: f64, epsilon: f64) -> Self {
        let num_buckets =
            ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln()).ceil() as usize + 1;
        Self {
            num_buckets,
            first_bucket_size,
            ratio,
            epsilon,
        }
    }

    /// CPU usage in cores, up to 1000 cores
    pub fn cpu() -> Self {
        Self::build(1000.0, 0.01, 1.05, 1e-4)
    }

    /// Memory usage in bytes, up to 1 TB
    pub fn memory() -> Self {
        Self::build(1e12, 1e7, 1.05, 1e-4)
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn find_bucket(&self, value: f64) -> usize {
        if value < self.first_bucket_size {
            return 0;
        }
        let bucket = ((value * (self.ratio - 1.0) / self.first_bucket_size + 1.0).ln()
            / self.ratio.ln())
        .floor() as usize;
        bucket.min(self.num_buckets - 1)
    }

    pub fn bucket_start(&self, bucket: usize) -> f64 {
        if bucket == 0 {
            return 0.0;
        }
        self.first_bucket_size * (self.ratio.powi(bucket as i32) - 1.0) / (self.ratio - 1.0)
    }
}

/// Serialised form of a decaying histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramCheckpoint {
    /// Time at which a sample has weight factor 1
    pub reference_time: Option<DateTime<Utc>>,
    /// Non-empty buckets only
    pub buckets: BTreeMap<usize, f64>,
    pub total_weight: f64,
}

/// Histogram where a sample added at time `t` has its weight multiplied by
/// `2^((t - reference) / half_life)`. Newer samples therefore dominate and
/// the effective weight of a sample halves every half-life.
#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    options: HistogramOptions,
    weights: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
    half_life: Duration,
    reference: Option<DateTime<Utc>>,
}

impl DecayingHistogram {
    pub fn new(options: HistogramOptions, half_life: Duration) -> Self {
        let num_buckets = options.num_buckets;
        Self {
            options,
            weights: vec![0.0; num_buckets],
            total_weight: 0.0,
            min_bucket: num_buckets - 1,
            max_bucket: 0,
            half_life: half_life.max(Duration::from_secs(1)),
            reference: None,
        }
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.reference
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.total_weight < self.options.epsilon
    }

    fn half_life_secs(&self) -> i64 {
        self.half_life.as_secs() as i64
    }

    /// Rounds a time to the nearest multiple of the half-life since the epoch.
    fn align(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let h = self.half_life_secs();
        let secs = time.timestamp();
        let aligned = (secs + h / 2).div_euclid(h) * h;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(time)
    }

    fn exponent(&self, time: DateTime<Utc>, reference: DateTime<Utc>) -> f64 {
        (time - reference).num_milliseconds() as f64 / (self.half_life_secs() as f64 * 1000.0)
    }

    fn decay_factor(&mut self, time: DateTime<Utc>) -> f64 {
        let reference = match self.reference {
            Some(reference) => reference,
            None => {
                let reference = self.align(time);
                self.reference = Some(reference);
                reference
            }
        };
        if self.exponent(time, reference) > MAX_DECAY_EXPONENT {
            self.shift_reference(time);
        }
        match self.reference {
            Some(reference) => 2f64.powf(self.exponent(time, reference)),
            None => 1.0,
        }
    }

    /// Moves the reference time, rescaling every bucket so that relative
    /// weights are preserved.
    fn shift_reference(&mut self, new_reference: DateTime<Utc>) {
        let new_reference = self.align(new_reference);
        if let Some(old) = self.reference {
            let exponent = self.exponent(old, new_reference).round() as i32;
            self.scale(2f64.powi(exponent));
        }
        self.reference = Some(new_reference);
    }

    fn scale(&mut self, factor: f64) {
        for weight in &mut self.weights[self.min_bucket.min(self.max_bucket)..=self.max_bucket] {
            *weight *= factor;
        }
        self.total_weight *= factor;
    }

    fn add_weight(&mut self, bucket: usize, weight: f64) {
        self.weights[bucket] += weight;
        self.total_weight += weight;
        self.min_bucket = self.min_bucket.min(bucket);
        self.max_bucket = self.max_bucket.max(bucket);
    }

    /// Adds a sample. Negative weights are ignored.
    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        if weight < 0.0 || !weight.is_finite() {
            return;
        }
        let factor = self.decay_factor(time);
        let bucket = self.options.find_bucket(value);
        self.add_weight(bucket, weight * factor);
    }

    /// Returns the start of the bucket after the one where the cumulative
    /// weight reaches `percentile`, or 0 for an empty histogram.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile * self.total_weight;
        let mut partial = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial += self.weights[bucket];
            if partial >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.options.num_buckets - 1 {
            self.options.bucket_start(bucket + 1)
        } else {
            self.options.bucket_start(bucket)
        }
    }

    /// Adds another histogram with the same options into this one.
    pub fn merge(&mut self, other: &DecayingHistogram) {
        let Some(other_reference) = other.reference else {
            return;
        };
        if other.is_empty() {
            return;
        }
        match self.reference {
            None => {
                self.reference = Some(other_reference);
            }
            Some(reference) if other_reference > reference => {
                self.shift_reference(other_reference);
            }
            Some(_) => {}
        }
        let reference = self.reference.unwrap_or(other_reference);
        let factor = 2f64.powf(self.exponent(other_reference, reference));
        for bucket in other.min_bucket..=other.max_bucket {
            let weight = other.weights[bucket];
            if weight > 0.0 {
                self.add_weight(bucket, weight * factor);
            }
        }
    }

    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let buckets = self
            .weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0.0)
            .map(|(i, w)| (i, *w))
            .collect();
        HistogramCheckpoint {
            reference_time: self.reference,
            buckets,
            total_weight: self.total_weight,
        }
    }

    /// Replaces the contents with a checkpoint.
    pub fn load_from_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> Result<(), ModelError> {
        let num_buckets = self.options.num_buckets;
        for (bucket, weight) in &checkpoint.buckets {
            if *bucket >= num_buckets {
                return Err(ModelError::InvalidCheckpoint(format!(
                    "bucket {} out of range, histogram has {} buckets",
                    bucket, num_buckets
                )));
            }
            if *weight < 0.0 || !weight.is_finite() {
                return Err(ModelError::InvalidCheckpoint(format!(
                    "bucket {} has invalid weight {}",
                    bucket, weight
                )));
            }
        }

        self.weights = vec![0.0; num_buckets];
        self.total_weight = 0.0;
        self.min_bucket = num_buckets - 1;
        self.max_bucket = 0;
        for (bucket, weight) in &checkpoint.buckets {
            if *weight > 0.0 {
                self.add_weight(*bucket, *weight);
            }
        }
        self.reference = checkpoint.reference_time;
        Ok(())
    }
}
