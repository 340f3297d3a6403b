//! Cluster summaries, step-fit results, and persisted regression records.

use serde::{Deserialize, Serialize};

use crate::frame::DataFrame;
use crate::tile::CommitNumber;

/// Verdict of a step fit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum StepFitStatus {
    /// No interesting step.
    #[default]
    None,
    /// Values stepped up.
    High,
    /// Values stepped down.
    Low,
}

/// The numbers behind a step-fit verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct StepFit {
    /// Fit error of the two-level step model.
    pub least_squares: f32,
    /// Column offset of the fitted step within the window.
    pub turning_point: usize,
    /// `mean(right) - mean(left)`.
    pub step_size: f32,
    /// Normalized step magnitude compared against the interestingness
    /// threshold; sign follows `step_size`.
    pub regression: f32,
    pub status: StepFitStatus,
}

/// Summary of one cluster of traces, for persistence and UI display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClusterSummary {
    /// The cluster centroid, normalized.
    pub centroid: Vec<f32>,
    /// Structured keys of member traces (possibly a sample).
    pub keys: Vec<String>,
    /// Total number of member traces.
    pub num: usize,
    pub step_fit: StepFit,
    /// The commit the step lands on.
    pub step_point: CommitNumber,
}

/// User triage verdict on a regression side.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum TriageStatus {
    #[default]
    Untriaged,
    /// A real regression.
    Positive,
    /// Expected or benign.
    Negative,
    Ignored,
}

impl TriageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untriaged => "untriaged",
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Ignored => "ignored",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "untriaged" => Some(Self::Untriaged),
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

/// Triage status plus an operator note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriageState {
    pub status: TriageStatus,
    pub message: String,
}

/// One side (high or low) of a persisted regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub cluster: ClusterSummary,
    /// Shortcut id for the member trace keys.
    pub shortcut: String,
    /// The dataframe the cluster was found in, for chart recreation.
    pub frame: Option<DataFrame>,
}

/// The persisted record for a `(commit_number, alert_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Regression {
    pub high: Option<Finding>,
    pub low: Option<Finding>,
    pub triage_high: TriageState,
    pub triage_low: TriageState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_status_round_trips() {
        for s in [
            TriageStatus::Untriaged,
            TriageStatus::Positive,
            TriageStatus::Negative,
            TriageStatus::Ignored,
        ] {
            assert_eq!(TriageStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(TriageStatus::from_str("bogus"), None);
    }

    #[test]
    fn regression_serializes_with_null_sides() {
        let r = Regression::default();
        let json = serde_json::to_string(&r).unwrap();
        let back: Regression = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!(back.high.is_none());
        assert_eq!(back.triage_high.status, TriageStatus::Untriaged);
    }
}
