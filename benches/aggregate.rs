//! Aggregation of one large drained batch at increasing tag cardinality.

mod common;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use cloud_aggregator::metrics::Aggregator;
use cloud_aggregator::{AggregationConfig, HttpTrail};

const TRAILS: usize = 500_000;

fn config() -> AggregationConfig {
    let mut config = AggregationConfig {
        aggregation_period_ms: 200,
        calc_interval_ms: 200,
        push_interval_ms: 200,
        ..AggregationConfig::default()
    };
    config.bucket_tags.push("url".into());
    config
}

fn trails(cardinality: usize) -> Vec<HttpTrail> {
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    (1..=TRAILS)
        .map(|i| {
            let tags = common::tags(i, cardinality, common::status(i, cardinality));
            common::trail(now, i as u64, tags)
        })
        .collect()
}

fn bench_aggregate_trails(c: &mut Criterion) {
    let config = config();
    let mut group = c.benchmark_group("aggregate_trails");
    group.sample_size(10);

    for cardinality in [1, 5, 35, 315, 3645].iter() {
        let input = trails(*cardinality);

        group.bench_with_input(BenchmarkId::new("tags", cardinality), cardinality, |b, _| {
            b.iter_batched(
                || (Aggregator::new(&config), input.clone()),
                |(mut aggregator, batch)| {
                    aggregator.ingest(batch);
                    black_box(aggregator.flush_all())
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_aggregate_trails);
criterion_main!(benches);
