//! The regression store: persisted findings keyed by
//! `(commit_number, alert_id)`, with user triage as an orthogonal
//! mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use perf_core::errors::{PerfError, Result};
use perf_core::regression::{Finding, Regression, TriageState, TriageStatus};
use perf_core::tile::CommitNumber;

use crate::connection::{sql_err, DatabaseManager};

/// Which side of a regression record a finding lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    High,
    Low,
}

impl Side {
    fn column(self) -> &'static str {
        match self {
            Side::High => "high",
            Side::Low => "low",
        }
    }
}

#[derive(Clone)]
pub struct RegressionStore {
    db: Arc<DatabaseManager>,
}

impl RegressionStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Record a high finding. Returns true only when the high side was
    /// previously absent; repeats refresh the payload and never touch
    /// triage.
    pub fn set_high(
        &self,
        commit: CommitNumber,
        alert_id: i64,
        finding: &Finding,
    ) -> Result<bool> {
        self.set_side(commit, alert_id, Side::High, finding)
    }

    /// As `set_high`, for the low side.
    pub fn set_low(&self, commit: CommitNumber, alert_id: i64, finding: &Finding) -> Result<bool> {
        self.set_side(commit, alert_id, Side::Low, finding)
    }

    fn set_side(
        &self,
        commit: CommitNumber,
        alert_id: i64,
        side: Side,
        finding: &Finding,
    ) -> Result<bool> {
        let payload = serde_json::to_string(finding)
            .map_err(|e| PerfError::invalid_input(format!("finding does not serialize: {e}")))?;
        let column = side.column();
        self.db.with_writer(|conn| {
            let existing: Option<Option<String>> = conn
                .query_row(
                    &format!(
                        "SELECT {column} FROM regressions
                         WHERE commit_number = ?1 AND alert_id = ?2"
                    ),
                    params![commit.0, alert_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            match existing {
                None => {
                    conn.execute(
                        &format!(
                            "INSERT INTO regressions (commit_number, alert_id, {column})
                             VALUES (?1, ?2, ?3)"
                        ),
                        params![commit.0, alert_id, payload],
                    )
                    .map_err(sql_err)?;
                    Ok(true)
                }
                Some(current) => {
                    conn.execute(
                        &format!(
                            "UPDATE regressions SET {column} = ?3
                             WHERE commit_number = ?1 AND alert_id = ?2"
                        ),
                        params![commit.0, alert_id, payload],
                    )
                    .map_err(sql_err)?;
                    Ok(current.is_none())
                }
            }
        })
    }

    /// Mutate the high-side triage status. Never creates a record and
    /// never touches the finding payload.
    pub fn triage_high(
        &self,
        commit: CommitNumber,
        alert_id: i64,
        triage: &TriageState,
    ) -> Result<()> {
        self.triage_side(commit, alert_id, Side::High, triage)
    }

    /// As `triage_high`, for the low side.
    pub fn triage_low(
        &self,
        commit: CommitNumber,
        alert_id: i64,
        triage: &TriageState,
    ) -> Result<()> {
        self.triage_side(commit, alert_id, Side::Low, triage)
    }

    fn triage_side(
        &self,
        commit: CommitNumber,
        alert_id: i64,
        side: Side,
        triage: &TriageState,
    ) -> Result<()> {
        let (status_col, message_col) = match side {
            Side::High => ("triage_high_status", "triage_high_message"),
            Side::Low => ("triage_low_status", "triage_low_message"),
        };
        self.db.with_writer(|conn| {
            let affected = conn
                .execute(
                    &format!(
                        "UPDATE regressions SET {status_col} = ?3, {message_col} = ?4
                         WHERE commit_number = ?1 AND alert_id = ?2"
                    ),
                    params![commit.0, alert_id, triage.status.as_str(), triage.message],
                )
                .map_err(sql_err)?;
            if affected == 0 {
                return Err(PerfError::not_found(format!(
                    "no regression at commit {} for alert {alert_id}",
                    commit.0
                )));
            }
            Ok(())
        })
    }

    /// The record for a `(commit, alert)` pair, if any.
    pub fn get(&self, commit: CommitNumber, alert_id: i64) -> Result<Option<Regression>> {
        self.db.with_reader(|conn| {
            conn.query_row(
                "SELECT high, low, triage_high_status, triage_high_message,
                        triage_low_status, triage_low_message
                 FROM regressions WHERE commit_number = ?1 AND alert_id = ?2",
                params![commit.0, alert_id],
                row_to_regression,
            )
            .optional()
            .map_err(sql_err)?
            .transpose()
        })
    }

    /// All regressions with `begin <= commit_number <= end`, commit
    /// numbers ascending.
    pub fn range(
        &self,
        begin: CommitNumber,
        end: CommitNumber,
    ) -> Result<BTreeMap<CommitNumber, BTreeMap<i64, Regression>>> {
        self.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT commit_number, alert_id, high, low,
                            triage_high_status, triage_high_message,
                            triage_low_status, triage_low_message
                     FROM regressions
                     WHERE commit_number >= ?1 AND commit_number <= ?2
                     ORDER BY commit_number",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![begin.0, end.0], |r| {
                    Ok((
                        r.get::<_, i32>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, String>(7)?,
                    ))
                })
                .map_err(sql_err)?;
            let mut out: BTreeMap<CommitNumber, BTreeMap<i64, Regression>> = BTreeMap::new();
            for row in rows {
                let (commit, alert_id, high, low, ths, thm, tls, tlm) = row.map_err(sql_err)?;
                let regression = build_regression(high, low, &ths, thm, &tls, tlm)?;
                out.entry(CommitNumber(commit))
                    .or_default()
                    .insert(alert_id, regression);
            }
            Ok(out)
        })
    }

    /// Regressions with an untriaged side, over commits in the time
    /// window, optionally restricted to one alert category.
    pub fn untriaged_count_in_window(
        &self,
        t0: i64,
        t1: i64,
        category: Option<&str>,
    ) -> Result<i64> {
        self.db.with_reader(|conn| {
            let untriaged = "((r.high IS NOT NULL AND r.triage_high_status = 'untriaged')
                 OR (r.low IS NOT NULL AND r.triage_low_status = 'untriaged'))";
            match category {
                None => conn
                    .query_row(
                        &format!(
                            "SELECT COUNT(*) FROM regressions r
                             JOIN commits c ON c.commit_number = r.commit_number
                             WHERE c.commit_time >= ?1 AND c.commit_time <= ?2
                               AND {untriaged}"
                        ),
                        params![t0, t1],
                        |r| r.get(0),
                    )
                    .map_err(sql_err),
                Some(category) => conn
                    .query_row(
                        &format!(
                            "SELECT COUNT(*) FROM regressions r
                             JOIN commits c ON c.commit_number = r.commit_number
                             JOIN alerts a ON a.id = r.alert_id
                             WHERE c.commit_time >= ?1 AND c.commit_time <= ?2
                               AND a.category = ?3
                               AND {untriaged}"
                        ),
                        params![t0, t1, category],
                        |r| r.get(0),
                    )
                    .map_err(sql_err),
            }
        })
    }
}

type RegressionRow = (
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
);

fn row_to_regression(r: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Regression>> {
    let (high, low, ths, thm, tls, tlm): RegressionRow = (
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
    );
    Ok(build_regression(high, low, &ths, thm, &tls, tlm))
}

fn build_regression(
    high: Option<String>,
    low: Option<String>,
    triage_high_status: &str,
    triage_high_message: String,
    triage_low_status: &str,
    triage_low_message: String,
) -> Result<Regression> {
    let parse_side = |payload: Option<String>| -> Result<Option<Finding>> {
        payload
            .map(|p| {
                serde_json::from_str(&p)
                    .map_err(|e| PerfError::fatal(format!("corrupt regression payload: {e}")))
            })
            .transpose()
    };
    let parse_status = |s: &str| -> Result<TriageStatus> {
        TriageStatus::from_str(s)
            .ok_or_else(|| PerfError::fatal(format!("unknown triage status {s:?}")))
    };
    Ok(Regression {
        high: parse_side(high)?,
        low: parse_side(low)?,
        triage_high: TriageState {
            status: parse_status(triage_high_status)?,
            message: triage_high_message,
        },
        triage_low: TriageState {
            status: parse_status(triage_low_status)?,
            message: triage_low_message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use perf_core::regression::ClusterSummary;

    fn store() -> (RegressionStore, Arc<DatabaseManager>) {
        let db = Arc::new(DatabaseManager::open_in_memory().unwrap());
        (RegressionStore::new(Arc::clone(&db)), db)
    }

    fn finding(num: usize) -> Finding {
        Finding {
            cluster: ClusterSummary { num, ..ClusterSummary::default() },
            shortcut: "abc123".to_string(),
            frame: None,
        }
    }

    #[test]
    fn set_high_is_new_exactly_once() {
        let (regressions, _db) = store();
        assert!(regressions.set_high(CommitNumber(10), 1, &finding(5)).unwrap());
        assert!(!regressions.set_high(CommitNumber(10), 1, &finding(7)).unwrap());
        assert!(!regressions.set_high(CommitNumber(10), 1, &finding(7)).unwrap());
        // The payload was refreshed.
        let r = regressions.get(CommitNumber(10), 1).unwrap().unwrap();
        assert_eq!(r.high.unwrap().cluster.num, 7);
        // The low side of the same record is still new.
        assert!(regressions.set_low(CommitNumber(10), 1, &finding(3)).unwrap());
        assert!(!regressions.set_low(CommitNumber(10), 1, &finding(3)).unwrap());
    }

    #[test]
    fn triage_mutates_only_existing_records() {
        let (regressions, _db) = store();
        let triage = TriageState {
            status: TriageStatus::Negative,
            message: "expected".to_string(),
        };
        // Create-on-missing is disallowed.
        assert!(regressions.triage_high(CommitNumber(10), 1, &triage).is_err());
        assert!(regressions.get(CommitNumber(10), 1).unwrap().is_none());

        regressions.set_high(CommitNumber(10), 1, &finding(5)).unwrap();
        regressions.triage_high(CommitNumber(10), 1, &triage).unwrap();
        let r = regressions.get(CommitNumber(10), 1).unwrap().unwrap();
        assert_eq!(r.triage_high.status, TriageStatus::Negative);
        assert_eq!(r.triage_high.message, "expected");
        // The cluster payload is untouched.
        assert_eq!(r.high.unwrap().cluster.num, 5);
        // And triage survives a payload refresh.
        regressions.set_high(CommitNumber(10), 1, &finding(9)).unwrap();
        let r = regressions.get(CommitNumber(10), 1).unwrap().unwrap();
        assert_eq!(r.triage_high.status, TriageStatus::Negative);
    }

    #[test]
    fn range_orders_commits_ascending() {
        let (regressions, _db) = store();
        regressions.set_high(CommitNumber(30), 1, &finding(1)).unwrap();
        regressions.set_high(CommitNumber(10), 1, &finding(1)).unwrap();
        regressions.set_high(CommitNumber(20), 2, &finding(1)).unwrap();
        regressions.set_high(CommitNumber(40), 1, &finding(1)).unwrap();

        let window = regressions.range(CommitNumber(10), CommitNumber(30)).unwrap();
        let commits: Vec<CommitNumber> = window.keys().copied().collect();
        assert_eq!(commits, vec![CommitNumber(10), CommitNumber(20), CommitNumber(30)]);
        assert!(window[&CommitNumber(20)].contains_key(&2));
    }

    #[test]
    fn untriaged_count_filters_by_window_and_category() {
        let (regressions, db) = store();
        db.with_writer(|conn| {
            conn.execute_batch(
                "INSERT INTO commits (commit_number, git_hash, commit_time, author, subject)
                 VALUES (10, 'aaa', 1000, 'a', 's'), (20, 'bbb', 2000, 'a', 's');
                 INSERT INTO alerts (id, alert, category) VALUES
                 (1, '{}', 'rendering'), (2, '{}', 'io');",
            )
            .map_err(crate::connection::sql_err)
        })
        .unwrap();

        regressions.set_high(CommitNumber(10), 1, &finding(1)).unwrap();
        regressions.set_high(CommitNumber(20), 2, &finding(1)).unwrap();

        assert_eq!(regressions.untriaged_count_in_window(0, 3000, None).unwrap(), 2);
        assert_eq!(regressions.untriaged_count_in_window(1500, 3000, None).unwrap(), 1);
        assert_eq!(
            regressions
                .untriaged_count_in_window(0, 3000, Some("rendering"))
                .unwrap(),
            1
        );

        regressions
            .triage_high(
                CommitNumber(10),
                1,
                &TriageState { status: TriageStatus::Positive, message: String::new() },
            )
            .unwrap();
        assert_eq!(regressions.untriaged_count_in_window(0, 3000, None).unwrap(), 1);
    }
}
