use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use cloud_aggregator::{HttpTrail, MetricKind, Sample, SampleSubmitter, SingleValue, TagSet};

/// Requests each worker simulates before submitting a batch
const REQUESTS_PER_BATCH: usize = 50;

/// Pause between batches, per worker
const BATCH_PAUSE: Duration = Duration::from_millis(20);

/// Endpoints the synthetic traffic spreads over
const ENDPOINTS: &[(&str, &str)] = &[
    ("GET", "/api/users/:id"),
    ("GET", "/api/products/:id"),
    ("POST", "/api/sessions"),
    ("POST", "/api/users"),
];

// ─── Public entry point ──────────────────────────────────────────

/// Spawns `concurrency` Tokio tasks that submit synthetic HTTP trails
/// until the deadline or the `running` flag is set to false.
pub async fn run(running: Arc<AtomicBool>, submitter: SampleSubmitter, concurrency: u32, duration: Duration) {
    let deadline = Instant::now() + duration;

    let mut handles = Vec::with_capacity(concurrency as usize);

    for worker_id in 0..concurrency {
        let running = running.clone();
        let submitter = submitter.clone();

        handles.push(tokio::spawn(async move {
            worker(worker_id, concurrency, running, submitter, deadline).await;
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    running.store(false, Ordering::SeqCst);
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(id: u32, vus: u32, running: Arc<AtomicBool>, submitter: SampleSubmitter, deadline: Instant) {
    // Each worker gets its own deterministic RNG seeded uniquely.
    let mut rng = StdRng::seed_from_u64(1000 + u64::from(id));
    let vu = id.to_string();

    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
        let mut batch: Vec<Sample> = (0..REQUESTS_PER_BATCH)
            .map(|_| Sample::HttpTrail(synthetic_trail(&mut rng, &vu)))
            .collect();

        batch.push(Sample::Single(SingleValue {
            metric: "vus".into(),
            time: Utc::now(),
            kind: MetricKind::Gauge,
            tags: TagSet::empty(),
            value: f64::from(vus),
        }));

        submitter.submit(batch);
        tokio::time::sleep(BATCH_PAUSE).await;
    }
}

/// One request's timing breakdown with a small, realistic tag vocabulary.
pub fn synthetic_trail(rng: &mut impl Rng, vu: &str) -> HttpTrail {
    let (method, name) = ENDPOINTS[rng.gen_range(0..ENDPOINTS.len())];
    let status = match rng.gen_range(0u8..100) {
        0..=1 => "500",
        2..=6 => "404",
        _ => "200",
    };

    let blocked = micros_between(rng, 1, 50);
    let connecting = micros_between(rng, 0, 300);
    let tls_handshaking = micros_between(rng, 0, 800);
    let sending = micros_between(rng, 5, 60);
    // Occasional slow response to give the outlier filter something to do
    let waiting = if rng.gen_bool(0.01) {
        micros_between(rng, 200_000, 900_000)
    } else {
        micros_between(rng, 800, 6_000)
    };
    let receiving = micros_between(rng, 10, 400);

    let duration = sending + waiting + receiving;
    let tags = TagSet::from_pairs_lossy([
        ("method", method),
        ("name", name),
        ("status", status),
        ("expected_response", if status == "200" { "true" } else { "false" }),
        ("group", ""),
        ("vu", vu),
    ]);

    HttpTrail {
        end_time: Utc::now(),
        blocked,
        connecting,
        tls_handshaking,
        sending,
        waiting,
        receiving,
        conn_duration: connecting + tls_handshaking + duration,
        duration,
        tags: Some(tags),
    }
}

fn micros_between(rng: &mut impl Rng, lo: u64, hi: u64) -> Duration {
    Duration::from_micros(rng.gen_range(lo..hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_trail_is_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let t = synthetic_trail(&mut rng, "3");
            assert_eq!(t.duration, t.sending + t.waiting + t.receiving);
            assert!(t.conn_duration >= t.duration);
            let tags = t.tags.unwrap();
            assert_eq!(tags.get("vu"), Some("3"));
            assert!(tags.get("name").is_some());
        }
    }

    #[test]
    fn test_deterministic_per_seed() {
        let a = synthetic_trail(&mut StdRng::seed_from_u64(1), "0");
        let b = synthetic_trail(&mut StdRng::seed_from_u64(1), "0");
        assert_eq!(a.duration, b.duration);
        assert_eq!(a.tags, b.tags);
    }
}
