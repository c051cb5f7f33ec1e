pub mod aggregator;
pub mod buffer;
pub mod encoder;
pub mod percentiles;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tags::TagSet;

pub use aggregator::{AggregatedRecord, Aggregator, AggregatorStats};
pub use buffer::SampleBuffer;
pub use encoder::{EncodeOutcome, EncodedBatch, SampleEncoder};
pub use percentiles::{DimensionSummary, OutlierPolicy, Percentile, StatsReducer};

/// Metric name HTTP trails are reported under, aggregated or not.
pub const TRAIL_METRIC: &str = "http_req_li_all";

/// How the remote side should interpret a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

/// One observation of a non-trail metric. Never aggregated by this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleValue {
    pub metric: String,
    pub time: DateTime<Utc>,
    pub kind: MetricKind,
    pub tags: TagSet,
    pub value: f64,
}

/// Timing breakdown of one completed HTTP request.
/// This is the "write" side: producers build these and submit them.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTrail {
    pub end_time: DateTime<Utc>,
    pub blocked: Duration,
    pub connecting: Duration,
    pub tls_handshaking: Duration,
    pub sending: Duration,
    pub waiting: Duration,
    pub receiving: Duration,
    /// connecting + TLS handshaking + sending + waiting + receiving
    pub conn_duration: Duration,
    /// sending + waiting + receiving
    pub duration: Duration,
    /// `None` when the producer had no usable tag data; buckets as empty.
    pub tags: Option<TagSet>,
}

/// Inbound sample, as produced by the load generator.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Single(SingleValue),
    HttpTrail(HttpTrail),
}

/// Outbound sample, as handed to the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudSample {
    SingleValue(SingleValue),
    AggregatedTrail(AggregatedRecord),
    /// A trail from a tag bucket too small to aggregate, unmodified.
    PassThroughTrail(HttpTrail),
}

impl CloudSample {
    /// Variant tag written on the wire.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::SingleValue(_) => "Point",
            Self::AggregatedTrail(_) => "AggregatedPoints",
            Self::PassThroughTrail(_) => "Points",
        }
    }

    pub fn metric(&self) -> &str {
        match self {
            Self::SingleValue(v) => &v.metric,
            Self::AggregatedTrail(_) | Self::PassThroughTrail(_) => TRAIL_METRIC,
        }
    }
}

/// The numeric timing dimensions of an [`HttpTrail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrailDimension {
    Duration,
    Blocked,
    Connecting,
    TlsHandshaking,
    Sending,
    Waiting,
    Receiving,
    ConnDuration,
}

impl TrailDimension {
    pub const ALL: [TrailDimension; 8] = [
        Self::Duration,
        Self::Blocked,
        Self::Connecting,
        Self::TlsHandshaking,
        Self::Sending,
        Self::Waiting,
        Self::Receiving,
        Self::ConnDuration,
    ];

    pub fn metric_name(self) -> &'static str {
        match self {
            Self::Duration => "http_req_duration",
            Self::Blocked => "http_req_blocked",
            Self::Connecting => "http_req_connecting",
            Self::TlsHandshaking => "http_req_tls_handshaking",
            Self::Sending => "http_req_sending",
            Self::Waiting => "http_req_waiting",
            Self::Receiving => "http_req_receiving",
            Self::ConnDuration => "http_req_conn_duration",
        }
    }

    pub fn of(self, trail: &HttpTrail) -> Duration {
        match self {
            Self::Duration => trail.duration,
            Self::Blocked => trail.blocked,
            Self::Connecting => trail.connecting,
            Self::TlsHandshaking => trail.tls_handshaking,
            Self::Sending => trail.sending,
            Self::Waiting => trail.waiting,
            Self::Receiving => trail.receiving,
            Self::ConnDuration => trail.conn_duration,
        }
    }
}
