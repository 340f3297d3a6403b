//! The regression detector: expand an alert into sub-queries, window the
//! data around candidate commits, cluster, step-fit, and persist
//! qualifying findings.

use std::sync::Arc;

use tracing::warn;

use perf_core::alert::{Alert, ClusterAlgo, StepDetection};
use perf_core::cancel::CancellationToken;
use perf_core::errors::{PerfError, Result};
use perf_core::paramset::ParamSet;
use perf_core::query::Query;
use perf_core::regression::{ClusterSummary, Finding, StepFitStatus};
use perf_core::tile::{CommitDetail, CommitNumber};
use perf_core::traits::Notifier;
use perf_storage::{CommitStore, RegressionStore, ShortcutStore, TraceStore};

use crate::dataframe::DataFrameBuilder;
use crate::kmeans;
use crate::stepfit::{step_fit_at, MIN_STD_DEV};
use crate::vecops::{fill, missing_ratio, norm};

/// Traces with more than this share of missing data on either side of
/// the candidate are excluded from analysis.
const MAX_MISSING_RATIO: f32 = 0.5;

/// Cap on member keys carried in a cluster summary.
const MAX_KEYS_PER_CLUSTER: usize = 50;

#[derive(Clone)]
pub struct Detector {
    store: TraceStore,
    builder: DataFrameBuilder,
    commits: CommitStore,
    regressions: RegressionStore,
    shortcuts: ShortcutStore,
    notifier: Arc<dyn Notifier>,
}

impl Detector {
    pub fn new(
        store: TraceStore,
        commits: CommitStore,
        regressions: RegressionStore,
        shortcuts: ShortcutStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let builder = DataFrameBuilder::new(store.clone(), commits.clone());
        Self { store, builder, commits, regressions, shortcuts, notifier }
    }

    /// Expand an alert into its concrete sub-queries. Without group_by
    /// this is the alert's query; with group_by it is the Cartesian
    /// product of the grouped keys' values inside the query's sub-space.
    pub fn expand_alert(&self, alert: &Alert, token: &CancellationToken) -> Result<Vec<Query>> {
        let base = Query::parse(&alert.query)?;
        let keys = alert.group_by_keys();
        if keys.is_empty() {
            return Ok(vec![base]);
        }
        let tile = match self.store.latest_tile() {
            Ok(t) => t,
            Err(PerfError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        // The paramset of the traces the query actually matches.
        let mut sub_space = ParamSet::new();
        let rx = self.store.query_trace_ids_only(tile, &base, token)?;
        for params in rx {
            sub_space.add_params(&params?);
        }

        let mut combos = vec![base];
        for key in keys {
            let Some(values) = sub_space.values_for(key) else {
                // The grouped key never occurs inside the sub-space.
                return Ok(Vec::new());
            };
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    next.push(combo.with_constraint(key, value));
                }
            }
            combos = next;
        }
        Ok(combos)
    }

    /// Analyze one candidate commit for an alert. Qualifying clusters are
    /// persisted idempotently (when the alert is saved) and returned; the
    /// owner is notified only on a brand-new finding.
    pub fn detect_at(
        &self,
        alert: &Alert,
        commit: CommitNumber,
        default_radius: i32,
        token: &CancellationToken,
    ) -> Result<Vec<ClusterSummary>> {
        let radius = if alert.radius > 0 { alert.radius } else { default_radius };
        let mut found = Vec::new();
        for query in self.expand_alert(alert, token)? {
            token.check()?;
            let df = self.builder.build_around(&query, commit, radius, token)?;
            let Some(center) = df.column_of(commit) else { continue };
            if center == 0 || center + 1 >= df.num_columns() {
                continue; // not enough window on one side
            }

            let mut keys: Vec<String> = Vec::new();
            let mut rows: Vec<Vec<f32>> = Vec::new();
            for (key, row) in &df.traceset {
                let left = &row[..center];
                let right = &row[center + 1..];
                if missing_ratio(left) > MAX_MISSING_RATIO
                    || missing_ratio(right) > MAX_MISSING_RATIO
                {
                    continue;
                }
                keys.push(key.clone());
                rows.push(row.clone());
            }
            if rows.is_empty() {
                continue;
            }

            let clusters = match alert.algo {
                ClusterAlgo::KMeans => kmeans_clusters(&keys, &rows, center, alert),
                ClusterAlgo::StepFit => stepfit_clusters(&keys, &rows, center, alert),
            };

            for mut summary in clusters {
                if summary.step_fit.turning_point != center {
                    continue;
                }
                if !alert.direction.matches(summary.step_fit.status) {
                    continue;
                }
                if summary.num < alert.minimum_num.max(0) as usize {
                    continue;
                }
                summary.step_point = commit;
                if alert.id_is_set() {
                    self.persist(alert, commit, &summary, &df)?;
                }
                found.push(summary);
            }
        }
        Ok(found)
    }

    /// Sweep the last `n` commits that have data, most recent first.
    /// `progress` is called with (done, total) after each commit.
    pub fn run(
        &self,
        alert: &Alert,
        n: usize,
        default_radius: i32,
        token: &CancellationToken,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<(CommitNumber, ClusterSummary)>> {
        let candidates = self.store.recent_commits_with_data(n)?;
        let total = candidates.len();
        let mut found = Vec::new();
        for (i, commit) in candidates.into_iter().enumerate() {
            token.check()?;
            for summary in self.detect_at(alert, commit, default_radius, token)? {
                found.push((commit, summary));
            }
            progress(i + 1, total);
        }
        Ok(found)
    }

    fn persist(
        &self,
        alert: &Alert,
        commit: CommitNumber,
        summary: &ClusterSummary,
        df: &perf_core::frame::DataFrame,
    ) -> Result<()> {
        let shortcut = self.shortcuts.insert_or_get(&summary.keys)?;
        let finding = Finding {
            cluster: summary.clone(),
            shortcut,
            frame: Some(df.clone()),
        };
        let is_new = match summary.step_fit.status {
            StepFitStatus::High => self.regressions.set_high(commit, alert.id, &finding)?,
            StepFitStatus::Low => self.regressions.set_low(commit, alert.id, &finding)?,
            StepFitStatus::None => false,
        };
        if is_new {
            let detail = self.commits.details(commit).unwrap_or(CommitDetail {
                commit_number: commit,
                git_hash: String::new(),
                commit_time: 0,
                author: String::new(),
                subject: String::new(),
            });
            if let Err(e) = self.notifier.regression_found(&detail, alert, summary) {
                warn!(alert = alert.id, commit = commit.0, "notifier failed: {e}");
            }
        }
        Ok(())
    }
}

/// Cluster normalized traces with k-means and step-fit each centroid at
/// the candidate column.
fn kmeans_clusters(
    keys: &[String],
    rows: &[Vec<f32>],
    center: usize,
    alert: &Alert,
) -> Vec<ClusterSummary> {
    let mut normed: Vec<Vec<f32>> = rows.to_vec();
    for row in &mut normed {
        fill(row);
        norm(row, MIN_STD_DEV);
    }
    let k = if alert.k > 0 { alert.k as usize } else { kmeans::auto_k(normed.len()) };
    kmeans::cluster(&normed, k)
        .into_iter()
        .map(|cluster| {
            let step_fit = step_fit_at(&cluster.centroid, center, alert.step, alert.interesting);
            let num = cluster.members.len();
            let keys: Vec<String> = cluster
                .members
                .iter()
                .take(MAX_KEYS_PER_CLUSTER)
                .map(|&i| keys[i].clone())
                .collect();
            ClusterSummary {
                centroid: cluster.centroid,
                keys,
                num,
                step_fit,
                step_point: CommitNumber::BAD,
            }
        })
        .collect()
}

/// Step-fit every trace individually and group by verdict.
fn stepfit_clusters(
    keys: &[String],
    rows: &[Vec<f32>],
    center: usize,
    alert: &Alert,
) -> Vec<ClusterSummary> {
    let mut groups: [(StepFitStatus, Vec<usize>); 2] = [
        (StepFitStatus::High, Vec::new()),
        (StepFitStatus::Low, Vec::new()),
    ];
    let mut fit_inputs: Vec<Vec<f32>> = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let mut filled = row.clone();
        fill(&mut filled);
        if alert.step == StepDetection::Original {
            norm(&mut filled, MIN_STD_DEV);
        }
        let fit = step_fit_at(&filled, center, alert.step, alert.interesting);
        match fit.status {
            StepFitStatus::High => groups[0].1.push(i),
            StepFitStatus::Low => groups[1].1.push(i),
            StepFitStatus::None => {}
        }
        fit_inputs.push(filled);
    }

    groups
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(status, members)| {
            let rows_ref: Vec<&[f32]> = members.iter().map(|&i| fit_inputs[i].as_slice()).collect();
            let centroid = crate::vecops::centroid(&rows_ref, fit_inputs[members[0]].len());
            let mut step_fit = step_fit_at(&centroid, center, alert.step, alert.interesting);
            // The group's verdict is authoritative for its members.
            step_fit.status = status;
            let num = members.len();
            let keys: Vec<String> = members
                .iter()
                .take(MAX_KEYS_PER_CLUSTER)
                .map(|&i| keys[i].clone())
                .collect();
            ClusterSummary {
                centroid,
                keys,
                num,
                step_fit,
                step_point: CommitNumber::BAD,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use perf_core::alert::Direction;

    fn flat_alert() -> Alert {
        Alert {
            query: "arch=x86".into(),
            algo: ClusterAlgo::StepFit,
            direction: Direction::Up,
            radius: 3,
            interesting: 2.0,
            ..Alert::default()
        }
    }

    #[test]
    fn stepfit_grouping_splits_by_verdict() {
        let alert = flat_alert();
        let keys: Vec<String> = (0..3).map(|i| format!(",t={i},")).collect();
        let up = vec![1.0, 1.0, 1.0, 9.0, 9.0, 9.0, 9.0];
        let down = vec![9.0, 9.0, 9.0, 1.0, 1.0, 1.0, 1.0];
        let flat = vec![5.0; 7];
        let clusters = stepfit_clusters(&keys, &[up, down, flat], 3, &alert);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].step_fit.status, StepFitStatus::High);
        assert_eq!(clusters[0].keys, vec![",t=0,"]);
        assert_eq!(clusters[1].step_fit.status, StepFitStatus::Low);
        assert_eq!(clusters[1].keys, vec![",t=1,"]);
    }

    #[test]
    fn kmeans_clusters_step_fit_at_center() {
        let alert = Alert {
            algo: ClusterAlgo::KMeans,
            k: 2,
            interesting: 2.0,
            ..flat_alert()
        };
        let keys: Vec<String> = (0..6).map(|i| format!(",t={i},")).collect();
        let mut rows = Vec::new();
        for _ in 0..4 {
            rows.push(vec![1.0, 1.0, 1.0, 20.0, 20.0, 20.0, 20.0]);
        }
        for _ in 0..2 {
            rows.push(vec![5.0; 7]);
        }
        let clusters = kmeans_clusters(&keys, &rows, 3, &alert);
        let stepped: Vec<_> = clusters
            .iter()
            .filter(|c| c.step_fit.status == StepFitStatus::High)
            .collect();
        assert_eq!(stepped.len(), 1);
        assert_eq!(stepped[0].num, 4);
        assert_eq!(stepped[0].step_fit.turning_point, 3);
    }
}
