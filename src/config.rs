//! Aggregation configuration
//!
//! The core consumes this configuration; where it comes from (CLI flags,
//! environment, a remote test definition) is up to the embedding tool.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::metrics::encoder::{percentile_label, ENVELOPE_OVERHEAD, MIN_RECORD_BUDGET};

/// Upper bound on a single encoded batch (64 MiB)
pub const MAX_BATCH_BYTES_LIMIT: usize = 64 * 1024 * 1024;

/// Lower bound on a single encoded batch: the envelope plus room for one record
pub const MIN_BATCH_BYTES: usize = ENVELOPE_OVERHEAD + MIN_RECORD_BUDGET;

/// Upper bound on buffer shards
pub const MAX_BUFFER_SHARDS: usize = 1024;

/// What to do with a trail whose time bucket was already flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateSamplePolicy {
    /// Discard it and count the loss.
    #[default]
    Drop,
    /// Re-home it into the earliest bucket that is still open.
    MergeIntoNext,
}

/// Everything the aggregation pipeline reads from configuration.
///
/// Deserializes from JSON with every field optional:
///
/// ```rust
/// use cloud_aggregator::AggregationConfig;
///
/// let config = AggregationConfig::from_json(r#"{ "min_samples": 10 }"#).unwrap();
/// assert_eq!(config.min_samples, 10);
/// assert_eq!(config.aggregation_period_ms, 3000);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationConfig {
    /// Width of a time bucket. `0` disables aggregation entirely.
    #[serde(default = "default_aggregation_period_ms")]
    pub aggregation_period_ms: u64,

    /// How long to keep a finished bucket open for stragglers
    #[serde(default = "default_aggregation_wait_period_ms")]
    pub aggregation_wait_period_ms: u64,

    /// Calc cadence: drain, aggregate, encode
    #[serde(default = "default_calc_interval_ms")]
    pub calc_interval_ms: u64,

    /// Submission cadence; a multiple of `calc_interval_ms`
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,

    /// Tag keys forming the tag-bucket key
    #[serde(default = "default_bucket_tags")]
    pub bucket_tags: Vec<String>,

    /// Minimum tag-bucket size before samples are aggregated
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default)]
    pub skip_outlier_detection: bool,

    /// Quartiles are read at `0.5 - radius` and `0.5 + radius`
    #[serde(default = "default_outlier_iqr_radius")]
    pub outlier_iqr_radius: f64,

    #[serde(default = "default_outlier_iqr_coef_lower")]
    pub outlier_iqr_coef_lower: f64,

    #[serde(default = "default_outlier_iqr_coef_upper")]
    pub outlier_iqr_coef_upper: f64,

    /// Percentile fractions reported per dimension, each in `[0, 1]`
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,

    /// Per tag-bucket scan limit for the statistics reducer
    #[serde(default = "default_max_samples_scanned")]
    pub max_samples_scanned: usize,

    #[serde(default)]
    pub late_samples: LateSamplePolicy,

    #[serde(default = "default_max_samples_per_batch")]
    pub max_samples_per_batch: usize,

    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    #[serde(default = "default_buffer_shards")]
    pub buffer_shards: usize,
}

fn default_aggregation_period_ms() -> u64 {
    3_000
}
fn default_aggregation_wait_period_ms() -> u64 {
    5_000
}
fn default_calc_interval_ms() -> u64 {
    1_000
}
fn default_push_interval_ms() -> u64 {
    3_000
}
fn default_bucket_tags() -> Vec<String> {
    ["group", "method", "name", "status", "expected_response"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_min_samples() -> usize {
    25
}
fn default_outlier_iqr_radius() -> f64 {
    0.25
}
fn default_outlier_iqr_coef_lower() -> f64 {
    1.5
}
fn default_outlier_iqr_coef_upper() -> f64 {
    1.3
}
fn default_percentiles() -> Vec<f64> {
    vec![0.5, 0.95, 0.99]
}
fn default_max_samples_scanned() -> usize {
    50_000
}
fn default_max_samples_per_batch() -> usize {
    100_000
}
fn default_max_batch_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_buffer_shards() -> usize {
    16
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            aggregation_period_ms: default_aggregation_period_ms(),
            aggregation_wait_period_ms: default_aggregation_wait_period_ms(),
            calc_interval_ms: default_calc_interval_ms(),
            push_interval_ms: default_push_interval_ms(),
            bucket_tags: default_bucket_tags(),
            min_samples: default_min_samples(),
            skip_outlier_detection: false,
            outlier_iqr_radius: default_outlier_iqr_radius(),
            outlier_iqr_coef_lower: default_outlier_iqr_coef_lower(),
            outlier_iqr_coef_upper: default_outlier_iqr_coef_upper(),
            percentiles: default_percentiles(),
            max_samples_scanned: default_max_samples_scanned(),
            late_samples: LateSamplePolicy::default(),
            max_samples_per_batch: default_max_samples_per_batch(),
            max_batch_bytes: default_max_batch_bytes(),
            buffer_shards: default_buffer_shards(),
        }
    }
}

impl AggregationConfig {
    /// Parse a JSON document and validate the result.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// `None` when aggregation is disabled.
    pub fn aggregation_period(&self) -> Option<Duration> {
        (self.aggregation_period_ms > 0).then(|| Duration::from_millis(self.aggregation_period_ms))
    }

    pub fn wait_period(&self) -> Duration {
        Duration::from_millis(self.aggregation_wait_period_ms)
    }

    pub fn calc_interval(&self) -> Duration {
        Duration::from_millis(self.calc_interval_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    /// Check all values are within acceptable bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.calc_interval_ms == 0 {
            return Err(ConfigError::invalid("calc_interval_ms", "must be > 0"));
        }
        if self.push_interval_ms == 0 || self.push_interval_ms % self.calc_interval_ms != 0 {
            return Err(ConfigError::invalid(
                "push_interval_ms",
                format!(
                    "{} is not a positive multiple of calc_interval_ms {}",
                    self.push_interval_ms, self.calc_interval_ms
                ),
            ));
        }
        if self.min_samples == 0 {
            return Err(ConfigError::invalid("min_samples", "must be > 0"));
        }
        if self.bucket_tags.iter().any(String::is_empty) {
            return Err(ConfigError::invalid("bucket_tags", "tag keys must not be empty"));
        }
        if !(self.outlier_iqr_radius > 0.0 && self.outlier_iqr_radius <= 0.5) {
            return Err(ConfigError::invalid(
                "outlier_iqr_radius",
                format!("{} is outside (0, 0.5]", self.outlier_iqr_radius),
            ));
        }
        for (field, coef) in [
            ("outlier_iqr_coef_lower", self.outlier_iqr_coef_lower),
            ("outlier_iqr_coef_upper", self.outlier_iqr_coef_upper),
        ] {
            if !coef.is_finite() || coef < 0.0 {
                return Err(ConfigError::invalid(field, format!("{coef} must be finite and >= 0")));
            }
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .find(|p| !(0.0..=1.0).contains(*p))
        {
            return Err(ConfigError::invalid(
                "percentiles",
                format!("{p} is outside [0, 1]"),
            ));
        }
        // Each fraction becomes a key on the wire; two sharing a label would
        // leave one of them unreported
        let mut labels = BTreeSet::new();
        for p in &self.percentiles {
            let label = percentile_label(*p);
            if !labels.insert(label.clone()) {
                return Err(ConfigError::invalid(
                    "percentiles",
                    format!("{p} duplicates another fraction as {label}"),
                ));
            }
        }
        if self.max_samples_scanned == 0 {
            return Err(ConfigError::invalid("max_samples_scanned", "must be > 0"));
        }
        if self.max_samples_per_batch == 0 {
            return Err(ConfigError::invalid("max_samples_per_batch", "must be > 0"));
        }
        if !(MIN_BATCH_BYTES..=MAX_BATCH_BYTES_LIMIT).contains(&self.max_batch_bytes) {
            return Err(ConfigError::invalid(
                "max_batch_bytes",
                format!(
                    "{} is outside {MIN_BATCH_BYTES}..={MAX_BATCH_BYTES_LIMIT}",
                    self.max_batch_bytes
                ),
            ));
        }
        if self.buffer_shards == 0 || self.buffer_shards > MAX_BUFFER_SHARDS {
            return Err(ConfigError::invalid(
                "buffer_shards",
                format!("{} is outside 1..={MAX_BUFFER_SHARDS}", self.buffer_shards),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AggregationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregation_period(), Some(Duration::from_secs(3)));
        assert_eq!(config.min_samples, 25);
        assert_eq!(config.late_samples, LateSamplePolicy::Drop);
    }

    #[test]
    fn test_empty_json_matches_default() {
        let config = AggregationConfig::from_json("{}").unwrap();
        assert_eq!(config, AggregationConfig::default());
    }

    #[test]
    fn test_json_overrides() {
        let config = AggregationConfig::from_json(
            r#"{
                "aggregation_period_ms": 0,
                "bucket_tags": ["name"],
                "late_samples": "merge_into_next",
                "percentiles": [0.9]
            }"#,
        )
        .unwrap();
        assert_eq!(config.aggregation_period(), None);
        assert_eq!(config.bucket_tags, vec!["name".to_string()]);
        assert_eq!(config.late_samples, LateSamplePolicy::MergeIntoNext);
        assert_eq!(config.percentiles, vec![0.9]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = AggregationConfig::from_json(r#"{ "min_sample": 3 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    fn assert_invalid(expected: &str, mutate: impl FnOnce(&mut AggregationConfig)) {
        let mut config = AggregationConfig::default();
        mutate(&mut config);
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
            other => panic!("{expected}: expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_failures() {
        assert_invalid("calc_interval_ms", |c| c.calc_interval_ms = 0);
        assert_invalid("push_interval_ms", |c| c.push_interval_ms = 1_500);
        assert_invalid("min_samples", |c| c.min_samples = 0);
        assert_invalid("bucket_tags", |c| c.bucket_tags.push(String::new()));
        assert_invalid("outlier_iqr_radius", |c| c.outlier_iqr_radius = 0.75);
        assert_invalid("outlier_iqr_coef_lower", |c| c.outlier_iqr_coef_lower = -1.0);
        assert_invalid("outlier_iqr_coef_upper", |c| c.outlier_iqr_coef_upper = f64::NAN);
        assert_invalid("percentiles", |c| c.percentiles = vec![0.5, 1.5]);
        assert_invalid("max_samples_scanned", |c| c.max_samples_scanned = 0);
        assert_invalid("max_samples_per_batch", |c| c.max_samples_per_batch = 0);
        assert_invalid("max_batch_bytes", |c| c.max_batch_bytes = MAX_BATCH_BYTES_LIMIT + 1);
        assert_invalid("buffer_shards", |c| c.buffer_shards = 0);
    }

    #[test]
    fn test_batch_budget_must_fit_a_record() {
        assert_invalid("max_batch_bytes", |c| c.max_batch_bytes = 40);
        assert_invalid("max_batch_bytes", |c| c.max_batch_bytes = MIN_BATCH_BYTES - 1);

        let config = AggregationConfig {
            max_batch_bytes: MIN_BATCH_BYTES,
            ..AggregationConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_percentile_labels_must_be_distinct() {
        assert_invalid("percentiles", |c| c.percentiles = vec![0.5, 0.95, 0.5]);
        // Both render as p99.999
        assert_invalid("percentiles", |c| c.percentiles = vec![0.999991, 0.999994]);

        let config = AggregationConfig {
            percentiles: vec![0.5, 0.9, 0.99, 0.999],
            ..AggregationConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
