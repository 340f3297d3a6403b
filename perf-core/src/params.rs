//! Parameter maps, canonical structured keys, and trace ids.
//!
//! A trace is named by its parameter map. The canonical string form is
//! `,k1=v1,k2=v2,` with keys sorted and a terminating comma; the trace id
//! is the 16-byte xxh3 digest of that string. The digest is only relied on
//! for uniform distribution, never for collision resistance.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::errors::{PerfError, Result};

/// A trace's parameter map. `BTreeMap` keeps keys in the lexicographic
/// order the canonical form requires.
pub type Params = BTreeMap<String, String>;

/// The 16-byte digest of a canonical structured key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Digest an already-canonical structured key.
    pub fn from_structured_key(key: &str) -> Self {
        Self(xxh3_128(key.as_bytes()).to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

/// True when every byte is in `[a-zA-Z0-9._-]` and the chunk is non-empty.
pub fn valid_chunk(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

fn check_pair(key: &str, value: &str) -> Result<()> {
    if !valid_chunk(key) {
        return Err(PerfError::invalid_input(format!("invalid param key {key:?}")));
    }
    if !valid_chunk(value) {
        return Err(PerfError::invalid_input(format!(
            "invalid value {value:?} for param key {key}"
        )));
    }
    Ok(())
}

/// Canonical structured key for a parameter map: `,k1=v1,k2=v2,`.
pub fn structured_key(params: &Params) -> Result<String> {
    if params.is_empty() {
        return Err(PerfError::invalid_input("empty param map"));
    }
    let mut key = String::with_capacity(params.len() * 16);
    key.push(',');
    for (k, v) in params {
        check_pair(k, v)?;
        key.push_str(k);
        key.push('=');
        key.push_str(v);
        key.push(',');
    }
    Ok(key)
}

/// Parse a canonical structured key back into a parameter map.
pub fn parse_structured_key(key: &str) -> Result<Params> {
    let inner = key
        .strip_prefix(',')
        .and_then(|s| s.strip_suffix(','))
        .ok_or_else(|| PerfError::invalid_input(format!("not a structured key: {key:?}")))?;
    if inner.is_empty() {
        return Err(PerfError::invalid_input("empty structured key"));
    }
    let mut params = Params::new();
    for pair in inner.split(',') {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| PerfError::invalid_input(format!("malformed pair {pair:?}")))?;
        check_pair(k, v)?;
        params.insert(k.to_string(), v.to_string());
    }
    Ok(params)
}

/// Trace id straight from a parameter map.
pub fn trace_id_from_params(params: &Params) -> Result<TraceId> {
    Ok(TraceId::from_structured_key(&structured_key(params)?))
}

/// The `key=value` posting strings for a parameter map.
pub fn key_value_pairs(params: &Params) -> Vec<String> {
    params.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params_of(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn structured_key_sorts_and_terminates() {
        let p = params_of(&[("config", "8888"), ("arch", "x86")]);
        assert_eq!(structured_key(&p).unwrap(), ",arch=x86,config=8888,");
    }

    #[test]
    fn structured_key_rejects_bad_chars() {
        let p = params_of(&[("arch", "x86,565")]);
        assert!(structured_key(&p).is_err());
        let p = params_of(&[("a key", "x86")]);
        assert!(structured_key(&p).is_err());
        assert!(structured_key(&Params::new()).is_err());
    }

    #[test]
    fn parse_rejects_non_canonical() {
        assert!(parse_structured_key("arch=x86").is_err());
        assert!(parse_structured_key(",arch,").is_err());
        assert!(parse_structured_key(",,").is_err());
    }

    #[test]
    fn trace_ids_differ_by_params() {
        let a = trace_id_from_params(&params_of(&[("arch", "x86")])).unwrap();
        let b = trace_id_from_params(&params_of(&[("arch", "arm")])).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    proptest! {
        #[test]
        fn key_round_trips(params in prop::collection::btree_map(
            "[a-zA-Z0-9._-]{1,12}",
            "[a-zA-Z0-9._-]{1,12}",
            1..8,
        )) {
            let key = structured_key(&params).unwrap();
            let parsed = parse_structured_key(&key).unwrap();
            prop_assert_eq!(&parsed, &params);
            prop_assert_eq!(
                TraceId::from_structured_key(&key),
                trace_id_from_params(&parsed).unwrap()
            );
        }
    }
}
