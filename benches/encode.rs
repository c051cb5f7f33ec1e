//! Wire encoding of mixed single-value, aggregated and pass-through samples.

mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cloud_aggregator::config::MAX_BATCH_BYTES_LIMIT;
use cloud_aggregator::metrics::{AggregatedRecord, OutlierPolicy, SampleEncoder, StatsReducer};
use cloud_aggregator::{CloudSample, MetricKind, SingleValue, TrailDimension};

const PERCENTILES: [f64; 3] = [0.5, 0.95, 0.99];

/// Five copies of one trail folded into an aggregated record.
fn aggregated(trail: &cloud_aggregator::HttpTrail) -> AggregatedRecord {
    let dimensions = TrailDimension::ALL
        .iter()
        .filter_map(|&dim| {
            let mut reducer = StatsReducer::with_capacity(5);
            for _ in 0..5 {
                reducer.push(dim.of(trail));
            }
            reducer
                .finish(&OutlierPolicy::disabled(), &PERCENTILES)
                .map(|summary| (dim, summary))
        })
        .collect();
    AggregatedRecord {
        time: trail.end_time,
        tags: trail.tags.clone().unwrap_or_default(),
        original_count: 5,
        retained_count: 5,
        truncated: false,
        dimensions,
    }
}

fn samples(count: usize) -> Vec<CloudSample> {
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    (0..count)
        .map(|i| {
            let tags = common::tags(i, 200, "200");
            match i % 3 {
                0 => CloudSample::SingleValue(SingleValue {
                    metric: "something".into(),
                    time: now,
                    kind: MetricKind::Counter,
                    tags,
                    value: i as f64,
                }),
                1 => CloudSample::AggregatedTrail(aggregated(&common::trail(now, i as u64, tags))),
                _ => CloudSample::PassThroughTrail(common::trail(now, i as u64, tags)),
            }
        })
        .collect()
}

fn bench_encode_samples(c: &mut Criterion) {
    let encoder = SampleEncoder::new(usize::MAX, MAX_BATCH_BYTES_LIMIT);
    let mut group = c.benchmark_group("encode_samples");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    for count in [10_000, 100_000, 500_000].iter() {
        let input = samples(*count);
        let bytes: usize = encoder
            .encode(&input, 1)
            .batches
            .iter()
            .map(|b| b.payload.len())
            .sum();
        group.throughput(Throughput::Bytes(bytes as u64));

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(encoder.encode(&input, 1)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_samples);
criterion_main!(benches);
