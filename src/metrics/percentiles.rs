use std::time::Duration;

use crate::config::AggregationConfig;

/// IQR-based outlier exclusion settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierPolicy {
    pub enabled: bool,
    /// Quartiles are read at `0.5 - radius` and `0.5 + radius`
    pub iqr_radius: f64,
    pub coef_lower: f64,
    pub coef_upper: f64,
}

impl OutlierPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::from_config(&AggregationConfig::default())
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self {
            enabled: !config.skip_outlier_detection,
            iqr_radius: config.outlier_iqr_radius,
            coef_lower: config.outlier_iqr_coef_lower,
            coef_upper: config.outlier_iqr_coef_upper,
        }
    }
}

/// Value at a requested fraction of the retained set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentile {
    pub fraction: f64,
    pub value: Duration,
}

/// Summary of one timing dimension across a tag bucket.
/// `count` is the number of values left after outlier exclusion.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionSummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub percentiles: Vec<Percentile>,
}

// ─── StatsReducer ────────────────────────────────────────────────

/// Accumulates one dimension's values (in nanoseconds) and reduces them to
/// a [`DimensionSummary`].
///
/// Running count/min/max/sum are kept as values arrive; the value set is
/// sorted once in [`finish`](Self::finish) for quartiles and percentiles.
/// Integer arithmetic keeps the result independent of arrival order.
#[derive(Debug, Clone, Default)]
pub struct StatsReducer {
    count: usize,
    min: u64,
    max: u64,
    sum: u128,
    values: Vec<u64>,
}

impl StatsReducer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn push(&mut self, value: Duration) {
        let v = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        self.sum += u128::from(v);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Reduce to a summary. `None` if nothing was pushed.
    pub fn finish(mut self, outliers: &OutlierPolicy, fractions: &[f64]) -> Option<DimensionSummary> {
        if self.count == 0 {
            return None;
        }
        self.values.sort_unstable();

        let retained = if outliers.enabled {
            retain_normal(&self.values, outliers)
        } else {
            &self.values[..]
        };

        let (count, min, max, sum) = if retained.len() == self.values.len() {
            (self.count, self.min, self.max, self.sum)
        } else {
            (
                retained.len(),
                retained[0],
                retained[retained.len() - 1],
                retained.iter().map(|&v| u128::from(v)).sum(),
            )
        };

        let avg = u64::try_from(sum / count as u128).unwrap_or(u64::MAX);
        let percentiles = fractions
            .iter()
            .map(|&fraction| Percentile {
                fraction,
                value: Duration::from_nanos(value_at(retained, fraction).round() as u64),
            })
            .collect();

        Some(DimensionSummary {
            count,
            min: Duration::from_nanos(min),
            max: Duration::from_nanos(max),
            avg: Duration::from_nanos(avg),
            percentiles,
        })
    }
}

/// Slice of `sorted` inside `[Q1 - k_lower*IQR, Q3 + k_upper*IQR]`.
/// Falls back to the whole slice if the bounds would exclude everything.
fn retain_normal<'a>(sorted: &'a [u64], outliers: &OutlierPolicy) -> &'a [u64] {
    let radius = outliers.iqr_radius.clamp(0.0, 0.5);
    let q1 = value_at(sorted, 0.5 - radius);
    let q3 = value_at(sorted, 0.5 + radius);
    let iqr = q3 - q1;
    let lower = q1 - outliers.coef_lower * iqr;
    let upper = q3 + outliers.coef_upper * iqr;

    let start = sorted.partition_point(|&v| (v as f64) < lower);
    let end = sorted.partition_point(|&v| (v as f64) <= upper);
    if start >= end {
        return sorted;
    }
    &sorted[start..end]
}

/// Linear interpolation between adjacent ranks: rank = fraction * (n - 1).
fn value_at(sorted: &[u64], fraction: f64) -> f64 {
    let last = sorted.len().saturating_sub(1);
    let rank = fraction.clamp(0.0, 1.0) * last as f64;
    let lo = (rank.floor() as usize).min(last);
    let hi = (rank.ceil() as usize).min(last);

    let lower = sorted[lo] as f64;
    if lo == hi {
        return lower;
    }
    lower + (sorted[hi] as f64 - lower) * (rank - lo as f64)
}
