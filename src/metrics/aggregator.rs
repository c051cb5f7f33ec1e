use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::percentiles::{DimensionSummary, OutlierPolicy, StatsReducer};
use super::{CloudSample, HttpTrail, TrailDimension};
use crate::config::{AggregationConfig, LateSamplePolicy};
use crate::tags::TagSet;

// ─── Public types ────────────────────────────────────────────────

/// Summary of one tag bucket within one time bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    /// Midpoint of the time bucket
    pub time: DateTime<Utc>,
    /// The bucketing-key pairs shared by every member trail
    pub tags: TagSet,
    /// Trails in the tag bucket
    pub original_count: usize,
    /// Smallest post-exclusion count across dimensions
    pub retained_count: usize,
    /// Only the first `max_samples_scanned` trails fed the statistics
    pub truncated: bool,
    pub dimensions: Vec<(TrailDimension, DimensionSummary)>,
}

impl AggregatedRecord {
    pub fn dimension(&self, dimension: TrailDimension) -> Option<&DimensionSummary> {
        self.dimensions
            .iter()
            .find(|(d, _)| *d == dimension)
            .map(|(_, s)| s)
    }
}

/// Cumulative counters since the aggregator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub trails_ingested: u64,
    pub late_dropped: u64,
    pub late_merged: u64,
    pub aggregated_records: u64,
    pub passthrough_records: u64,
    pub truncated_records: u64,
}

/// Tag buckets of a single time bucket
type TagBuckets = HashMap<TagSet, Vec<HttpTrail>>;

// ─── Aggregator ──────────────────────────────────────────────────

/// Time-windowed, tag-bucketed aggregation of HTTP trails.
///
/// Trails are placed in the time bucket their end time floors to, then in
/// the tag bucket given by the canonical subset of their tags over the
/// configured key set. A time bucket is flushed once its end plus the wait
/// period has passed on the flush clock; after that, the bucket and every
/// earlier one are closed and further trails for them are late.
pub struct Aggregator {
    /// Bucket width in microseconds; `None` disables aggregation
    period_us: Option<i64>,
    wait_us: i64,
    bucket_tags: Vec<String>,
    min_samples: usize,
    max_samples_scanned: usize,
    outliers: OutlierPolicy,
    percentiles: Vec<f64>,
    late_policy: LateSamplePolicy,

    buckets: BTreeMap<i64, TagBuckets>,
    /// Trails waiting to be passed through when aggregation is disabled
    unaggregated: Vec<HttpTrail>,
    /// Highest closed bucket id
    watermark: Option<i64>,
    stats: AggregatorStats,
}

impl Aggregator {
    pub fn new(config: &AggregationConfig) -> Self {
        Self {
            period_us: config
                .aggregation_period()
                .map(|p| i64::try_from(p.as_micros()).unwrap_or(i64::MAX)),
            wait_us: i64::try_from(config.wait_period().as_micros()).unwrap_or(i64::MAX),
            bucket_tags: config.bucket_tags.clone(),
            min_samples: config.min_samples.max(1),
            max_samples_scanned: config.max_samples_scanned.max(1),
            outliers: OutlierPolicy::from_config(config),
            percentiles: config.percentiles.clone(),
            late_policy: config.late_samples,
            buckets: BTreeMap::new(),
            unaggregated: Vec::new(),
            watermark: None,
            stats: AggregatorStats::default(),
        }
    }

    /// Place drained trails into their buckets.
    pub fn ingest(&mut self, trails: impl IntoIterator<Item = HttpTrail>) {
        let Some(period_us) = self.period_us else {
            for trail in trails {
                self.stats.trails_ingested += 1;
                self.unaggregated.push(trail);
            }
            return;
        };

        let mut late_dropped = 0u64;
        for trail in trails {
            self.stats.trails_ingested += 1;

            let mut id = trail.end_time.timestamp_micros().div_euclid(period_us);
            if let Some(watermark) = self.watermark.filter(|w| id <= *w) {
                match self.late_policy {
                    LateSamplePolicy::Drop => {
                        late_dropped += 1;
                        continue;
                    }
                    LateSamplePolicy::MergeIntoNext => {
                        self.stats.late_merged += 1;
                        id = watermark + 1;
                    }
                }
            }

            // Missing tags bucket as the empty set
            let key = trail
                .tags
                .as_ref()
                .map(|t| t.canonical_subset(&self.bucket_tags))
                .unwrap_or_default();
            self.buckets
                .entry(id)
                .or_default()
                .entry(key)
                .or_default()
                .push(trail);
        }

        if late_dropped > 0 {
            self.stats.late_dropped += late_dropped;
            warn!(late_dropped, "dropped trails for already flushed time buckets");
        }
    }

    /// Flush every time bucket whose interval plus wait period has elapsed
    /// at `now`. Later buckets stay pending.
    pub fn flush_due(&mut self, now: DateTime<Utc>) -> Vec<CloudSample> {
        let mut out = self.take_unaggregated();
        let Some(period_us) = self.period_us else {
            return out;
        };

        // Bucket `id` is due once (id + 1) * period + wait <= now
        let last_due = now
            .timestamp_micros()
            .saturating_sub(self.wait_us)
            .div_euclid(period_us)
            - 1;
        self.watermark = Some(self.watermark.map_or(last_due, |w| w.max(last_due)));

        let pending = self.buckets.split_off(&(last_due + 1));
        let due = std::mem::replace(&mut self.buckets, pending);
        for (id, tag_buckets) in due {
            self.flush_bucket(id, period_us, tag_buckets, &mut out);
        }
        out
    }

    /// Flush everything regardless of completeness. Used on shutdown.
    pub fn flush_all(&mut self) -> Vec<CloudSample> {
        let mut out = self.take_unaggregated();
        let Some(period_us) = self.period_us else {
            return out;
        };

        let due = std::mem::take(&mut self.buckets);
        if let Some(&last) = due.keys().next_back() {
            self.watermark = Some(self.watermark.map_or(last, |w| w.max(last)));
        }
        for (id, tag_buckets) in due {
            self.flush_bucket(id, period_us, tag_buckets, &mut out);
        }
        out
    }

    /// Time buckets waiting to become due.
    pub fn pending_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Trails held in pending buckets.
    pub fn pending_trails(&self) -> usize {
        self.buckets
            .values()
            .flat_map(|tb| tb.values())
            .map(Vec::len)
            .sum::<usize>()
            + self.unaggregated.len()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    fn take_unaggregated(&mut self) -> Vec<CloudSample> {
        let trails = std::mem::take(&mut self.unaggregated);
        self.stats.passthrough_records += trails.len() as u64;
        trails.into_iter().map(CloudSample::PassThroughTrail).collect()
    }

    fn flush_bucket(
        &mut self,
        id: i64,
        period_us: i64,
        tag_buckets: TagBuckets,
        out: &mut Vec<CloudSample>,
    ) {
        let midpoint = id
            .checked_mul(period_us)
            .and_then(|start| start.checked_add(period_us / 2))
            .and_then(DateTime::<Utc>::from_timestamp_micros);

        // Emit in tag order so a flush is reproducible
        let mut groups: Vec<(TagSet, Vec<HttpTrail>)> = tag_buckets.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        debug!(bucket = id, tag_buckets = groups.len(), "flushing time bucket");

        for (tags, trails) in groups {
            if trails.len() < self.min_samples {
                self.stats.passthrough_records += trails.len() as u64;
                out.extend(trails.into_iter().map(CloudSample::PassThroughTrail));
                continue;
            }
            let time = midpoint.unwrap_or(trails[0].end_time);
            let record = self.reduce(time, tags, &trails);
            self.stats.aggregated_records += 1;
            out.push(CloudSample::AggregatedTrail(record));
        }
    }

    fn reduce(&mut self, time: DateTime<Utc>, tags: TagSet, trails: &[HttpTrail]) -> AggregatedRecord {
        let truncated = trails.len() > self.max_samples_scanned;
        let scanned = &trails[..trails.len().min(self.max_samples_scanned)];
        if truncated {
            self.stats.truncated_records += 1;
            warn!(
                trails = trails.len(),
                scanned = scanned.len(),
                ?tags,
                "tag bucket exceeds scan limit, statistics truncated"
            );
        }

        let dimensions: Vec<(TrailDimension, DimensionSummary)> = TrailDimension::ALL
            .iter()
            .filter_map(|&dim| {
                let mut reducer = StatsReducer::with_capacity(scanned.len());
                for trail in scanned {
                    reducer.push(dim.of(trail));
                }
                reducer
                    .finish(&self.outliers, &self.percentiles)
                    .map(|summary| (dim, summary))
            })
            .collect();

        let retained_count = dimensions.iter().map(|(_, s)| s.count).min().unwrap_or(0);

        AggregatedRecord {
            time,
            tags,
            original_count: trails.len(),
            retained_count,
            truncated,
            dimensions,
        }
    }
}
