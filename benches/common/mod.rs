//! Sample generators shared by the benchmarks.

#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};

use cloud_aggregator::{HttpTrail, TagSet};

/// Tag set for the `i`-th request with roughly `cardinality` distinct
/// bucketing keys across a run.
pub fn tags(i: usize, cardinality: usize, status: &str) -> TagSet {
    let c = i % cardinality;
    TagSet::from_pairs_lossy([
        ("test".to_owned(), "mest".to_owned()),
        ("a".to_owned(), "b".to_owned()),
        ("custom".to_owned(), format!("group{}", c % 9)),
        ("group".to_owned(), format!("group{}", c % 5)),
        ("url".to_owned(), format!("something{}", c % 11)),
        ("name".to_owned(), format!("else{}", c % 11)),
        ("status".to_owned(), status.to_owned()),
    ])
}

/// Status for the `i`-th request: mostly 200 with a fixed share of errors.
pub fn status(i: usize, cardinality: usize) -> &'static str {
    match i % cardinality % 7 {
        6 => "404",
        5 => "500",
        _ => "200",
    }
}

pub fn trail(now: DateTime<Utc>, i: u64, tags: TagSet) -> HttpTrail {
    let ms = Duration::from_millis;
    let step = i % 200;
    let sending = ms(step * 400);
    let waiting = ms(500);
    let receiving = ms(600);
    HttpTrail {
        end_time: now + chrono::Duration::nanoseconds((i % 100 * 100) as i64),
        blocked: ms(step * 100),
        connecting: ms(step * 200),
        tls_handshaking: ms(step * 300),
        sending,
        waiting,
        receiving,
        conn_duration: ms(500),
        duration: ms(i % 150 * 1500),
        tags: Some(tags),
    }
}
