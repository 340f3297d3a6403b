//! Structured queries over trace parameters.
//!
//! A query constrains some keys to one or more accepted values. The wire
//! form is URL-encoded (`arch=x86&config=8888&config=565`). Planning
//! validates the query against a tile's paramset: per constrained key an
//! OR-group of `key=value` postings, the final match being the
//! intersection of the groups.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use url::form_urlencoded;

use crate::errors::{PerfError, Result};
use crate::params::{valid_chunk, Params};
use crate::paramset::ReadOnlyParamSet;

/// A parsed structured query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    terms: BTreeMap<String, Vec<String>>,
}

/// One OR-group of a query plan: any of these postings matches the key.
#[derive(Debug, Clone, PartialEq)]
pub struct OrGroup {
    pub key: String,
    /// `key=value` posting strings, restricted to values the tile knows.
    pub postings: SmallVec<[String; 4]>,
}

impl Query {
    /// Parse a URL-encoded query string. Rejects empty queries and
    /// keys/values outside `[a-zA-Z0-9._-]`.
    pub fn parse(encoded: &str) -> Result<Query> {
        let mut terms: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in form_urlencoded::parse(encoded.as_bytes()) {
            if !valid_chunk(&key) {
                return Err(PerfError::invalid_input(format!("invalid query key {key:?}")));
            }
            if !valid_chunk(&value) {
                return Err(PerfError::invalid_input(format!(
                    "invalid query value {value:?} for key {key}"
                )));
            }
            let values = terms.entry(key.into_owned()).or_default();
            let value = value.into_owned();
            if !values.contains(&value) {
                values.push(value);
            }
        }
        if terms.is_empty() {
            return Err(PerfError::invalid_input("empty query"));
        }
        for values in terms.values_mut() {
            values.sort();
        }
        Ok(Query { terms })
    }

    /// Build a query that matches exactly the given key/value constraints.
    pub fn from_params(params: &Params) -> Result<Query> {
        let encoded: String = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        Query::parse(&encoded)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(|k| k.as_str())
    }

    pub fn values_for(&self, key: &str) -> Option<&[String]> {
        self.terms.get(key).map(|v| v.as_slice())
    }

    /// Re-encode in canonical (sorted) URL form.
    pub fn encode(&self) -> String {
        let mut ser = form_urlencoded::Serializer::new(String::new());
        for (k, values) in &self.terms {
            for v in values {
                ser.append_pair(k, v);
            }
        }
        ser.finish()
    }

    /// Extend this query with an additional constraint, replacing any
    /// existing constraint on the same key. Used for group_by expansion.
    pub fn with_constraint(&self, key: &str, value: &str) -> Query {
        let mut terms = self.terms.clone();
        terms.insert(key.to_string(), vec![value.to_string()]);
        Query { terms }
    }

    /// Plan this query against a tile's paramset.
    ///
    /// Unknown keys or values are legal; they make the plan empty for this
    /// tile only (the same query may match a neighboring tile). `None`
    /// means "empty result, issue no reads".
    pub fn plan(&self, paramset: &ReadOnlyParamSet) -> Option<Vec<OrGroup>> {
        let mut groups = Vec::with_capacity(self.terms.len());
        for (key, values) in &self.terms {
            let known = paramset.values_for(key)?;
            let postings: SmallVec<[String; 4]> = values
                .iter()
                .filter(|v| known.binary_search_by(|kv| kv.as_str().cmp(v)).is_ok())
                .map(|v| format!("{key}={v}"))
                .collect();
            if postings.is_empty() {
                return None;
            }
            groups.push(OrGroup { key: key.clone(), postings });
        }
        Some(groups)
    }

    /// True when the given parameter map satisfies every constraint.
    pub fn matches(&self, params: &Params) -> bool {
        self.terms.iter().all(|(key, values)| {
            params.get(key).is_some_and(|v| values.binary_search(v).is_ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramset::ParamSet;

    fn tile_paramset() -> ReadOnlyParamSet {
        let mut ps = ParamSet::new();
        ps.add("arch", "x86");
        ps.add("arch", "arm");
        ps.add("config", "8888");
        ps.freeze()
    }

    #[test]
    fn parse_collects_or_values() {
        let q = Query::parse("config=8888&config=565&arch=x86").unwrap();
        assert_eq!(q.values_for("config").unwrap(), &["565", "8888"]);
        assert_eq!(q.values_for("arch").unwrap(), &["x86"]);
        assert_eq!(q.encode(), "arch=x86&config=565&config=8888");
    }

    #[test]
    fn parse_rejects_empty_and_invalid() {
        assert!(Query::parse("").is_err());
        assert!(Query::parse("arch=x!86").is_err());
    }

    #[test]
    fn plan_intersects_known_values() {
        let q = Query::parse("arch=x86&config=8888").unwrap();
        let groups = q.plan(&tile_paramset()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].postings.as_slice(), &["arch=x86".to_string()]);
        assert_eq!(groups[1].postings.as_slice(), &["config=8888".to_string()]);
    }

    #[test]
    fn plan_is_empty_for_unknown_key_or_value() {
        let ps = tile_paramset();
        assert!(Query::parse("os=linux").unwrap().plan(&ps).is_none());
        assert!(Query::parse("config=565").unwrap().plan(&ps).is_none());
        // A known value alongside an unknown one still plans.
        let q = Query::parse("config=565&config=8888").unwrap();
        let groups = q.plan(&ps).unwrap();
        assert_eq!(groups[0].postings.as_slice(), &["config=8888".to_string()]);
    }

    #[test]
    fn matches_checks_all_constraints() {
        let q = Query::parse("arch=x86&config=8888").unwrap();
        let mut p = Params::new();
        p.insert("arch".into(), "x86".into());
        p.insert("config".into(), "8888".into());
        p.insert("os".into(), "linux".into());
        assert!(q.matches(&p));
        p.insert("arch".into(), "arm".into());
        assert!(!q.matches(&p));
    }

    #[test]
    fn with_constraint_narrows() {
        let q = Query::parse("arch=x86").unwrap();
        let narrowed = q.with_constraint("config", "8888");
        assert_eq!(narrowed.values_for("config").unwrap(), &["8888"]);
        assert_eq!(narrowed.values_for("arch").unwrap(), &["x86"]);
    }
}
