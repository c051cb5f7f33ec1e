//! Property tests for tag sets and the statistics reducer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use proptest::prelude::*;

use cloud_aggregator::metrics::{OutlierPolicy, StatsReducer};
use cloud_aggregator::TagSet;

fn tag_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-z_]{1,8}", "[a-zA-Z0-9/:]{0,12}"), 0..12)
}

fn hash_of(tags: &TagSet) -> u64 {
    let mut h = DefaultHasher::new();
    tags.hash(&mut h);
    h.finish()
}

fn reduce(values: &[u64], outliers: &OutlierPolicy) -> cloud_aggregator::metrics::DimensionSummary {
    let mut reducer = StatsReducer::with_capacity(values.len());
    for &v in values {
        reducer.push(Duration::from_micros(v));
    }
    reducer.finish(outliers, &[0.5, 0.9, 0.95, 0.99]).unwrap()
}

fn default_outliers() -> OutlierPolicy {
    OutlierPolicy {
        enabled: true,
        iqr_radius: 0.25,
        coef_lower: 1.5,
        coef_upper: 1.3,
    }
}

mod tag_set {
    use super::*;

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(pairs in tag_pairs()) {
            // Dedupe first so "last wins" does not depend on order
            let unique: std::collections::BTreeMap<_, _> = pairs.into_iter().collect();
            let forward = TagSet::from_pairs_lossy(unique.clone());
            let backward = TagSet::from_pairs_lossy(unique.into_iter().rev());

            prop_assert_eq!(&forward, &backward);
            prop_assert_eq!(hash_of(&forward), hash_of(&backward));
            prop_assert_eq!(
                serde_json::to_string(&forward).unwrap(),
                serde_json::to_string(&backward).unwrap()
            );
        }

        #[test]
        fn subset_is_idempotent(pairs in tag_pairs(), keys in prop::collection::vec("[a-z_]{1,8}", 0..6)) {
            let tags = TagSet::from_pairs_lossy(pairs);
            let once = tags.canonical_subset(&keys);
            let twice = once.canonical_subset(&keys);

            prop_assert_eq!(&once, &twice);
            prop_assert!(once.len() <= tags.len());
            for (k, v) in once.iter() {
                prop_assert!(keys.iter().any(|key| key == k));
                prop_assert_eq!(tags.get(k), Some(v));
            }
        }

        #[test]
        fn merge_overrides_win(pairs in tag_pairs(), overrides in tag_pairs()) {
            let tags = TagSet::from_pairs_lossy(pairs);
            let merged = tags.merge(overrides.clone());

            let last: std::collections::BTreeMap<_, _> = overrides.into_iter().collect();
            for (k, v) in &last {
                prop_assert_eq!(merged.get(k), Some(v.as_str()));
            }
            for (k, v) in tags.iter() {
                if !last.contains_key(k) {
                    prop_assert_eq!(merged.get(k), Some(v));
                }
            }
        }
    }
}

mod reducer {
    use super::*;

    proptest! {
        #[test]
        fn result_ignores_arrival_order(mut values in prop::collection::vec(0u64..5_000_000, 1..300)) {
            let outliers = default_outliers();
            let a = reduce(&values, &outliers);
            values.reverse();
            let b = reduce(&values, &outliers);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn percentiles_are_ordered_and_bounded(values in prop::collection::vec(0u64..5_000_000, 1..300)) {
            let s = reduce(&values, &default_outliers());

            prop_assert!(s.count >= 1 && s.count <= values.len());
            prop_assert!(s.min <= s.avg && s.avg <= s.max);
            let mut prev = s.min;
            for p in &s.percentiles {
                prop_assert!(p.value >= prev);
                prop_assert!(p.value <= s.max);
                prev = p.value;
            }
        }

        #[test]
        fn disabled_filter_keeps_every_value(values in prop::collection::vec(0u64..5_000_000, 1..300)) {
            let s = reduce(&values, &OutlierPolicy::disabled());
            prop_assert_eq!(s.count, values.len());
            prop_assert_eq!(s.min, Duration::from_micros(*values.iter().min().unwrap()));
            prop_assert_eq!(s.max, Duration::from_micros(*values.iter().max().unwrap()));
        }
    }
}
