use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::error::TagError;

// ─── TagSet ──────────────────────────────────────────────────────

/// Immutable key/value metadata attached to a sample.
///
/// Pairs are held in key order, so two sets built from the same pairs in a
/// different order compare equal, hash equally and serialize to the same
/// bytes. Cloning is a reference-count bump; the map itself is never mutated
/// after construction, every "change" produces a new set.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagSet(Arc<BTreeMap<String, String>>);

impl TagSet {
    /// The empty tag set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a tag set, rejecting empty keys.
    /// On duplicate keys the last pair wins.
    pub fn try_from_pairs<I, K, V>(pairs: I) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            if k.is_empty() {
                return Err(TagError::EmptyKey { value: v });
            }
            map.insert(k, v);
        }
        Ok(Self(Arc::new(map)))
    }

    /// Like [`TagSet::try_from_pairs`], but malformed input yields the
    /// empty set instead of an error.
    pub fn from_pairs_lossy<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::try_from_pairs(pairs).unwrap_or_else(|err| {
            debug!(%err, "malformed tag set replaced with empty set");
            Self::empty()
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Derived set holding only the requested keys that are present here.
    /// Absent keys are skipped. Used to derive tag-bucket keys.
    pub fn canonical_subset<S: AsRef<str>>(&self, keys: &[S]) -> TagSet {
        let map: BTreeMap<String, String> = keys
            .iter()
            .filter_map(|k| {
                let k = k.as_ref();
                self.0.get(k).map(|v| (k.to_owned(), v.clone()))
            })
            .collect();

        // Nothing was dropped: share the existing allocation.
        if map.len() == self.0.len() {
            return self.clone();
        }
        Self(Arc::new(map))
    }

    /// Derived set with `overrides` merged in; on collision the override wins.
    pub fn merge<I, K, V>(&self, overrides: I) -> TagSet
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = (*self.0).clone();
        for (k, v) in overrides {
            let k = k.into();
            if k.is_empty() {
                continue;
            }
            map.insert(k, v.into());
        }
        Self(Arc::new(map))
    }
}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl Serialize for TagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    /// Lossy: see [`TagSet::from_pairs_lossy`].
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs_lossy(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(tags: &TagSet) -> u64 {
        let mut h = DefaultHasher::new();
        tags.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_construction_order_irrelevant() {
        let a = TagSet::try_from_pairs([("method", "GET"), ("status", "200")]).unwrap();
        let b = TagSet::try_from_pairs([("status", "200"), ("method", "GET")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_duplicate_key_last_wins() {
        let tags = TagSet::try_from_pairs([("status", "200"), ("status", "404")]).unwrap();
        assert_eq!(tags.get("status"), Some("404"));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn test_empty_key_rejected() {
        let err = TagSet::try_from_pairs([("", "x")]).unwrap_err();
        assert_eq!(err, TagError::EmptyKey { value: "x".into() });

        let lossy = TagSet::from_pairs_lossy([("url", "/"), ("", "x")]);
        assert!(lossy.is_empty());
    }

    #[test]
    fn test_canonical_subset() {
        let tags: TagSet = [("method", "GET"), ("url", "/a"), ("status", "200")]
            .into_iter()
            .collect();
        let sub = tags.canonical_subset(&["status", "method", "missing"]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.get("method"), Some("GET"));
        assert_eq!(sub.get("status"), Some("200"));
        assert!(!sub.contains_key("url"));
        assert!(!sub.contains_key("missing"));

        // Original is untouched.
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_canonical_subset_of_empty() {
        let sub = TagSet::empty().canonical_subset(&["name"]);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_merge_right_biased() {
        let tags: TagSet = [("status", "200"), ("group", "::a")].into_iter().collect();
        let merged = tags.merge([("status", "500"), ("extra", "1")]);
        assert_eq!(merged.get("status"), Some("500"));
        assert_eq!(merged.get("group"), Some("::a"));
        assert_eq!(merged.get("extra"), Some("1"));
        assert_eq!(tags.get("status"), Some("200"));
    }

    #[test]
    fn test_iter_in_key_order() {
        let tags: TagSet = [("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();
        let keys: Vec<&str> = tags.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
