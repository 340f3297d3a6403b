//! The two accepted measurement-file formats, tried in order: the
//! structured "version 1" format, then the legacy nested format.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use perf_core::errors::{PerfError, Result};
use perf_core::params::{structured_key, Params};

/// A parsed measurement file, normalized to flat parameter maps.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub git_hash: String,
    /// The top-level key map; carries the `branch` key when present.
    pub key: Params,
    pub samples: Vec<(Params, f32)>,
}

// ─── version 1 ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Version1File {
    version: u32,
    git_hash: String,
    #[serde(default)]
    key: BTreeMap<String, String>,
    #[serde(default)]
    results: Vec<Version1Result>,
}

#[derive(Debug, Deserialize)]
struct Version1Result {
    #[serde(default)]
    key: BTreeMap<String, String>,
    measurement: Option<f64>,
    measurements: Option<BTreeMap<String, Vec<Version1Measurement>>>,
}

#[derive(Debug, Deserialize)]
struct Version1Measurement {
    value: String,
    measurement: f64,
}

// ─── legacy ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LegacyFile {
    #[serde(rename = "gitHash")]
    git_hash: String,
    #[serde(default)]
    key: BTreeMap<String, String>,
    #[serde(default)]
    options: BTreeMap<String, String>,
    #[serde(default)]
    results: BTreeMap<String, BTreeMap<String, BTreeMap<String, serde_json::Value>>>,
}

/// Parse a measurement file. Both formats are tried; a file neither
/// understands is `InvalidInput`.
pub fn parse(data: &[u8]) -> Result<ParsedFile> {
    match serde_json::from_slice::<Version1File>(data) {
        Ok(file) if file.version == 1 => return parse_version1(file),
        Ok(file) => {
            return Err(PerfError::invalid_input(format!(
                "unsupported format version {}",
                file.version
            )))
        }
        Err(_) => {}
    }
    match serde_json::from_slice::<LegacyFile>(data) {
        Ok(file) => parse_legacy(file),
        Err(e) => Err(PerfError::invalid_input(format!("unparseable file: {e}"))),
    }
}

fn parse_version1(file: Version1File) -> Result<ParsedFile> {
    let mut samples = Vec::new();
    for result in &file.results {
        let mut base: Params = file.key.clone();
        base.extend(result.key.clone());

        if let Some(measurement) = result.measurement {
            push_sample(&mut samples, base.clone(), measurement);
        }
        if let Some(measurements) = &result.measurements {
            for (key, entries) in measurements {
                for entry in entries {
                    let mut params = base.clone();
                    params.insert(key.clone(), entry.value.clone());
                    push_sample(&mut samples, params, entry.measurement);
                }
            }
        }
    }
    Ok(ParsedFile {
        git_hash: file.git_hash,
        key: file.key,
        samples,
    })
}

/// The legacy format nests `test → config → sub_result → value`, with
/// optional per-config option maps. Option values prefixed `GL_` are
/// dropped.
fn parse_legacy(file: LegacyFile) -> Result<ParsedFile> {
    let mut base: Params = Params::new();
    extend_dropping_gl(&mut base, &file.key);
    extend_dropping_gl(&mut base, &file.options);

    let mut samples = Vec::new();
    for (test, configs) in &file.results {
        for (config, entries) in configs {
            let mut config_params = base.clone();
            config_params.insert("test".to_string(), test.clone());
            config_params.insert("config".to_string(), config.clone());
            if let Some(options) = entries.get("options").and_then(|v| v.as_object()) {
                for (k, v) in options {
                    if let Some(s) = v.as_str() {
                        if !s.starts_with("GL_") {
                            config_params.insert(k.clone(), s.to_string());
                        }
                    }
                }
            }
            for (sub_result, value) in entries {
                if sub_result == "options" {
                    continue;
                }
                let Some(number) = value.as_f64() else { continue };
                let mut params = config_params.clone();
                params.insert("sub_result".to_string(), sub_result.clone());
                push_sample(&mut samples, params, number);
            }
        }
    }
    Ok(ParsedFile {
        git_hash: file.git_hash,
        key: file.key,
        samples,
    })
}

fn extend_dropping_gl(params: &mut Params, src: &BTreeMap<String, String>) {
    for (k, v) in src {
        if !v.starts_with("GL_") {
            params.insert(k.clone(), v.clone());
        }
    }
}

/// Keep only samples whose params form a valid structured key; anything
/// else is logged and dropped rather than failing the whole file.
fn push_sample(samples: &mut Vec<(Params, f32)>, params: Params, value: f64) {
    match structured_key(&params) {
        Ok(_) => samples.push((params, value as f32)),
        Err(e) => warn!("dropping sample with invalid params: {e}"),
    }
}
