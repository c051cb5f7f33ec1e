//! Metric aggregation core for cloud reporting of load-test results.
//!
//! Producers submit raw samples; on a short timer the pipeline drains them,
//! folds HTTP trails into per-time-window, per-tag-bucket statistics, and
//! encodes the result into compact batches for an uploader on a longer
//! timer.
//!
//! ```text
//! producers ──submit──▶ SampleBuffer ──drain──▶ Aggregator ──▶ SampleEncoder ──▶ Uploader
//!                                  (calc cadence)                     (submission cadence)
//! ```
//!
//! * [`TagSet`]: immutable, content-hashed tag map with subset/merge.
//! * [`metrics::SampleBuffer`]: sharded append/drain accumulator.
//! * [`metrics::Aggregator`]: time and tag bucketing, pass-through for small buckets.
//! * [`metrics::StatsReducer`]: IQR outlier exclusion and percentiles.
//! * [`metrics::SampleEncoder`]: sequence-numbered JSON batches.
//! * [`pipeline::Pipeline`]: the two periodic tasks tying it together.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod tags;

pub use config::{AggregationConfig, LateSamplePolicy};
pub use error::{ConfigError, EncodeError, TagError, UploadError};
pub use metrics::{CloudSample, HttpTrail, MetricKind, Sample, SingleValue, TrailDimension};
pub use pipeline::{Pipeline, PipelineHandle, PipelineStatsSnapshot, SampleSubmitter, Uploader};
pub use tags::TagSet;
