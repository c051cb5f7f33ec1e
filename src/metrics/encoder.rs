//! Wire encoding of outbound samples
//!
//! Every record is self-describing:
//!
//! ```json
//! {"type":"AggregatedPoints","metric":"http_req_li_all","data":{...}}
//! ```
//!
//! Records are packed into batches of the form
//! `{"sequence":N,"samples":[record,...]}`, bounded by a record count and a
//! byte budget. Times are Unix microseconds, durations float milliseconds.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::aggregator::AggregatedRecord;
use super::percentiles::DimensionSummary;
use super::{CloudSample, HttpTrail, MetricKind, SingleValue, TrailDimension};
use crate::config::AggregationConfig;
use crate::error::EncodeError;
use crate::tags::TagSet;

/// Bytes a batch spends on its envelope, with the widest sequence number.
pub(crate) const ENVELOPE_OVERHEAD: usize =
    r#"{"sequence":"#.len() + 20 + r#","samples":["#.len() + "]}".len();

/// Room a batch must leave for one record. An aggregated record with eight
/// dimensions, a handful of percentiles and typical tags stays well below.
pub(crate) const MIN_RECORD_BUDGET: usize = 16 * 1024;

// ─── Output types ────────────────────────────────────────────────

/// One network call's worth of encoded samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub sequence: u64,
    pub sample_count: usize,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOutcome {
    pub batches: Vec<EncodedBatch>,
    /// Samples that could not be encoded and were left out
    pub dropped: usize,
}

impl EncodeOutcome {
    pub fn sample_count(&self) -> usize {
        self.batches.iter().map(|b| b.sample_count).sum()
    }
}

// ─── Wire shapes ─────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    metric: &'a str,
    data: WireData<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireData<'a> {
    Single(SingleData<'a>),
    Aggregated(AggregatedData<'a>),
    Trail(TrailData<'a>),
}

#[derive(Serialize)]
struct SingleData<'a> {
    time: i64,
    #[serde(rename = "type")]
    kind: MetricKind,
    tags: &'a TagSet,
    value: f64,
}

#[derive(Serialize)]
struct AggregatedData<'a> {
    time: i64,
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    retained: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
    tags: &'a TagSet,
    values: BTreeMap<&'static str, WireSummary>,
}

#[derive(Serialize)]
struct WireSummary {
    count: usize,
    min: f64,
    max: f64,
    avg: f64,
    #[serde(flatten)]
    percentiles: BTreeMap<String, f64>,
}

#[derive(Serialize)]
struct TrailData<'a> {
    time: i64,
    tags: &'a TagSet,
    values: BTreeMap<&'static str, f64>,
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

fn micros(t: &DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

/// `0.95` → `"p95"`, `0.999` → `"p99.9"`
pub(crate) fn percentile_label(fraction: f64) -> String {
    let pct = (fraction * 100.0 * 1000.0).round() / 1000.0;
    format!("p{pct}")
}

fn single_data(v: &SingleValue) -> Result<WireData<'_>, EncodeError> {
    if !v.value.is_finite() {
        return Err(EncodeError::NonFinite {
            metric: v.metric.clone(),
            value: v.value,
        });
    }
    Ok(WireData::Single(SingleData {
        time: micros(&v.time),
        kind: v.kind,
        tags: &v.tags,
        value: v.value,
    }))
}

fn summary(s: &DimensionSummary) -> WireSummary {
    WireSummary {
        count: s.count,
        min: millis(s.min),
        max: millis(s.max),
        avg: millis(s.avg),
        percentiles: s
            .percentiles
            .iter()
            .map(|p| (percentile_label(p.fraction), millis(p.value)))
            .collect(),
    }
}

fn aggregated_data(r: &AggregatedRecord) -> WireData<'_> {
    WireData::Aggregated(AggregatedData {
        time: micros(&r.time),
        kind: "aggregated_trend",
        count: r.original_count,
        retained: r.retained_count,
        truncated: r.truncated,
        tags: &r.tags,
        values: r
            .dimensions
            .iter()
            .map(|(dim, s)| (dim.metric_name(), summary(s)))
            .collect(),
    })
}

fn trail_data<'a>(t: &'a HttpTrail, empty: &'a TagSet) -> WireData<'a> {
    let mut values: BTreeMap<&'static str, f64> = TrailDimension::ALL
        .iter()
        .map(|dim| (dim.metric_name(), millis(dim.of(t))))
        .collect();
    values.insert("http_reqs", 1.0);
    WireData::Trail(TrailData {
        time: micros(&t.end_time),
        tags: t.tags.as_ref().unwrap_or(empty),
        values,
    })
}

// ─── SampleEncoder ───────────────────────────────────────────────

/// Serializes outbound samples into sequence-numbered batches.
///
/// Encoding is a pure function of the samples and the first sequence
/// number: the same input always yields byte-identical batches.
#[derive(Debug, Clone)]
pub struct SampleEncoder {
    max_samples: usize,
    max_bytes: usize,
}

impl SampleEncoder {
    pub fn new(max_samples: usize, max_bytes: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            max_bytes,
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self::new(config.max_samples_per_batch, config.max_batch_bytes)
    }

    /// Encode a single record.
    pub fn encode_record(&self, sample: &CloudSample) -> Result<Vec<u8>, EncodeError> {
        let empty = TagSet::empty();
        let data = match sample {
            CloudSample::SingleValue(v) => single_data(v)?,
            CloudSample::AggregatedTrail(r) => aggregated_data(r),
            CloudSample::PassThroughTrail(t) => trail_data(t, &empty),
        };
        let record = WireRecord {
            kind: sample.wire_type(),
            metric: sample.metric(),
            data,
        };
        let bytes = serde_json::to_vec(&record)?;
        if bytes.len() + ENVELOPE_OVERHEAD > self.max_bytes {
            return Err(EncodeError::Oversized {
                size: bytes.len(),
                budget: self.max_bytes,
            });
        }
        Ok(bytes)
    }

    /// Encode `samples` into batches numbered from `first_sequence`.
    /// Samples that fail to encode are dropped and counted.
    pub fn encode(&self, samples: &[CloudSample], first_sequence: u64) -> EncodeOutcome {
        let mut outcome = EncodeOutcome::default();
        let mut open: Option<BatchWriter> = None;

        for sample in samples {
            let record = match self.encode_record(sample) {
                Ok(record) => record,
                Err(err) => {
                    debug!(%err, metric = sample.metric(), "sample dropped from batch");
                    outcome.dropped += 1;
                    continue;
                }
            };

            if let Some(writer) = open.take() {
                if writer.fits(&record, self.max_samples, self.max_bytes) {
                    open = Some(writer);
                } else {
                    outcome.batches.push(writer.finish());
                }
            }
            let sequence = first_sequence + outcome.batches.len() as u64;
            open.get_or_insert_with(|| BatchWriter::new(sequence))
                .push(&record);
        }

        if let Some(writer) = open {
            outcome.batches.push(writer.finish());
        }
        if outcome.dropped > 0 {
            warn!(dropped = outcome.dropped, "samples failed to encode");
        }
        outcome
    }
}

struct BatchWriter {
    sequence: u64,
    count: usize,
    buf: Vec<u8>,
}

impl BatchWriter {
    fn new(sequence: u64) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(format!(r#"{{"sequence":{sequence},"samples":["#).as_bytes());
        Self {
            sequence,
            count: 0,
            buf,
        }
    }

    fn fits(&self, record: &[u8], max_samples: usize, max_bytes: usize) -> bool {
        // separator + record + closing "]}"
        self.count < max_samples && self.buf.len() + 1 + record.len() + 2 <= max_bytes
    }

    fn push(&mut self, record: &[u8]) {
        if self.count > 0 {
            self.buf.push(b',');
        }
        self.buf.extend_from_slice(record);
        self.count += 1;
    }

    fn finish(mut self) -> EncodedBatch {
        self.buf.extend_from_slice(b"]}");
        EncodedBatch {
            sequence: self.sequence,
            sample_count: self.count,
            payload: Bytes::from(self.buf),
        }
    }
}
