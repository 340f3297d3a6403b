//! ParamSets: the per-tile lexicon of observed parameter keys and values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::params::Params;

/// A mapping from parameter key to the set of values seen for that key.
/// Values are kept sorted and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    inner: BTreeMap<String, Vec<String>>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single key/value observation.
    pub fn add(&mut self, key: &str, value: &str) {
        let values = self.inner.entry(key.to_string()).or_default();
        if let Err(pos) = values.binary_search_by(|v| v.as_str().cmp(value)) {
            values.insert(pos, value.to_string());
        }
    }

    /// Record every pair of a parameter map.
    pub fn add_params(&mut self, params: &Params) {
        for (k, v) in params {
            self.add(k, v);
        }
    }

    /// Union another paramset into this one.
    pub fn union(&mut self, other: &ParamSet) {
        for (k, values) in &other.inner {
            for v in values {
                self.add(k, v);
            }
        }
    }

    pub fn values_for(&self, key: &str) -> Option<&[String]> {
        self.inner.get(key).map(|v| v.as_slice())
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.values_for(key)
            .is_some_and(|vs| vs.binary_search_by(|v| v.as_str().cmp(value)).is_ok())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Freeze into the read-only form used for query expansion.
    pub fn freeze(self) -> ReadOnlyParamSet {
        let keys = self.inner.keys().cloned().collect();
        ReadOnlyParamSet { keys, inner: self.inner }
    }
}

/// An immutable paramset with its keys in stable lexicographic order.
/// This is the authoritative lexicon for query planning in a tile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadOnlyParamSet {
    keys: Vec<String>,
    inner: BTreeMap<String, Vec<String>>,
}

impl ReadOnlyParamSet {
    /// Keys in sorted order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values_for(&self, key: &str) -> Option<&[String]> {
        self.inner.get(key).map(|v| v.as_slice())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.values_for(key)
            .is_some_and(|vs| vs.binary_search_by(|v| v.as_str().cmp(value)).is_ok())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_values_sorted_and_unique() {
        let mut ps = ParamSet::new();
        ps.add("config", "8888");
        ps.add("config", "565");
        ps.add("config", "8888");
        assert_eq!(ps.values_for("config").unwrap(), &["565", "8888"]);
    }

    #[test]
    fn union_is_superset() {
        let mut a = ParamSet::new();
        a.add("arch", "x86");
        let mut b = ParamSet::new();
        b.add("arch", "arm");
        b.add("os", "linux");
        a.union(&b);
        assert!(a.contains("arch", "x86"));
        assert!(a.contains("arch", "arm"));
        assert!(a.contains("os", "linux"));
    }

    #[test]
    fn freeze_orders_keys() {
        let mut ps = ParamSet::new();
        ps.add("os", "linux");
        ps.add("arch", "x86");
        let frozen = ps.freeze();
        assert_eq!(frozen.keys(), &["arch".to_string(), "os".to_string()]);
        assert!(frozen.contains("os", "linux"));
        assert!(!frozen.contains("os", "mac"));
    }
}
