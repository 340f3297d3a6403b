//! Alert configurations: what the continuous loop looks for.

use serde::{Deserialize, Serialize};

use crate::errors::{PerfError, Result};
use crate::params::valid_chunk;
use crate::query::Query;
use crate::regression::StepFitStatus;

/// Which direction of step change an alert cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    #[default]
    Both,
}

impl Direction {
    /// Does a step-fit verdict match this direction filter?
    pub fn matches(self, status: StepFitStatus) -> bool {
        match (self, status) {
            (_, StepFitStatus::None) => false,
            (Direction::Both, _) => true,
            (Direction::Up, StepFitStatus::High) => true,
            (Direction::Down, StepFitStatus::Low) => true,
            _ => false,
        }
    }
}

/// Clustering strategy for the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAlgo {
    #[default]
    KMeans,
    StepFit,
}

/// Step-detection algorithm applied to a cluster centroid or trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepDetection {
    /// Step size normalized by the fit error.
    #[default]
    #[serde(alias = "")]
    Original,
    /// Step size in absolute measurement units.
    Absolute,
    /// Step size as a fraction of the left-side mean.
    Percent,
    /// Cohen's d against the pooled standard deviation.
    Cohen,
    /// Mann-Whitney U rank test, normal approximation.
    MannWhitneyU,
}

/// Serialize the alert id as a decimal string, the way config files and
/// the UI carry it.
mod id_as_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
        let s = String::deserialize(de)?;
        if s.is_empty() {
            return Ok(super::Alert::BAD_ID);
        }
        s.parse::<i64>().map_err(de::Error::custom)
    }
}

/// A user-authored alert configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alert {
    /// Stable id; `-1` until first saved.
    #[serde(rename = "id_as_string", with = "id_as_string")]
    pub id: i64,
    pub display_name: String,
    /// URL-encoded structured query selecting the traces to scan.
    pub query: String,
    /// Comma-separated keys; expands the query into one sub-query per
    /// value combination. Empty means no expansion.
    pub group_by: String,
    pub algo: ClusterAlgo,
    pub direction: Direction,
    /// Commits on each side of the candidate in the analysis window.
    pub radius: i32,
    /// Cluster count for kmeans; 0 means auto.
    pub k: i32,
    /// Minimum number of matching traces for a cluster to qualify.
    pub minimum_num: i32,
    /// Interestingness threshold for the step fit.
    pub interesting: f32,
    pub step: StepDetection,
    /// Owner e-mail, notified on new regressions.
    pub owner: String,
    pub category: String,
    /// URI template with `{cluster_url}`, `{commit_url}`, `{message}`
    /// placeholders, expanded by the bug-tracker collaborator.
    pub bug_uri_template: String,
}

impl Default for Alert {
    fn default() -> Self {
        Self {
            id: Self::BAD_ID,
            display_name: String::new(),
            query: String::new(),
            group_by: String::new(),
            algo: ClusterAlgo::default(),
            direction: Direction::default(),
            radius: 10,
            k: 0,
            minimum_num: 0,
            interesting: 0.0,
            step: StepDetection::default(),
            owner: String::new(),
            category: String::new(),
            bug_uri_template: String::new(),
        }
    }
}

impl Alert {
    pub const BAD_ID: i64 = -1;

    pub fn id_is_set(&self) -> bool {
        self.id != Self::BAD_ID
    }

    /// The group_by keys, empty when no expansion is configured.
    pub fn group_by_keys(&self) -> Vec<&str> {
        self.group_by
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Validate the record against its own constraints.
    pub fn validate(&self) -> Result<()> {
        Query::parse(&self.query)
            .map_err(|e| PerfError::invalid_input(format!("alert query: {e}")))?;
        if self.radius < 0 {
            return Err(PerfError::invalid_input("radius must be non-negative"));
        }
        if self.k < 0 {
            return Err(PerfError::invalid_input("k must be non-negative"));
        }
        if self.minimum_num < 0 {
            return Err(PerfError::invalid_input("minimum_num must be non-negative"));
        }
        if self.interesting < 0.0 {
            return Err(PerfError::invalid_input("interesting must be non-negative"));
        }
        for key in self.group_by_keys() {
            if !valid_chunk(key) {
                return Err(PerfError::invalid_input(format!("invalid group_by key {key:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_round_trips_through_config_json() {
        let json = r#"{
            "id_as_string": "42",
            "display_name": "Render times",
            "query": "arch=x86&config=8888",
            "group_by": "model,os",
            "algo": "kmeans",
            "direction": "UP",
            "radius": 7,
            "k": 0,
            "minimum_num": 5,
            "interesting": 25.0,
            "step": "cohen",
            "owner": "owner@example.org",
            "category": "rendering",
            "bug_uri_template": "https://bugs.example.org/new?c={cluster_url}"
        }"#;
        let alert: Alert = serde_json::from_str(json).unwrap();
        assert_eq!(alert.id, 42);
        assert_eq!(alert.direction, Direction::Up);
        assert_eq!(alert.step, StepDetection::Cohen);
        assert_eq!(alert.group_by_keys(), vec!["model", "os"]);
        alert.validate().unwrap();

        let back: Alert = serde_json::from_str(&serde_json::to_string(&alert).unwrap()).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let mut alert = Alert { query: "arch=x86".into(), ..Alert::default() };
        alert.validate().unwrap();

        alert.radius = -1;
        assert!(alert.validate().is_err());

        alert.radius = 5;
        alert.query = String::new();
        assert!(alert.validate().is_err());

        alert.query = "arch=x86".into();
        alert.group_by = "bad key".into();
        assert!(alert.validate().is_err());
    }

    #[test]
    fn direction_matching() {
        use StepFitStatus::*;
        assert!(Direction::Up.matches(High));
        assert!(!Direction::Up.matches(Low));
        assert!(Direction::Down.matches(Low));
        assert!(Direction::Both.matches(High));
        assert!(Direction::Both.matches(Low));
        assert!(!Direction::Both.matches(None));
    }
}
