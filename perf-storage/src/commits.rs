//! The commit index: a dense bijection between git hash and commit number.

use std::sync::Arc;

use rusqlite::params;

use perf_core::errors::{PerfError, Result};
use perf_core::tile::{CommitDetail, CommitNumber};

use crate::connection::{sql_err, DatabaseManager};

/// Commit numbers are assigned in first-parent topological order by
/// `append`; the sequence is gap-free for the indexed range.
#[derive(Clone)]
pub struct CommitStore {
    db: Arc<DatabaseManager>,
}

impl CommitStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Record a commit and assign it the next dense number. Re-appending
    /// a known hash returns its existing number.
    pub fn append(
        &self,
        git_hash: &str,
        commit_time: i64,
        author: &str,
        subject: &str,
    ) -> Result<CommitNumber> {
        self.db.with_writer(|conn| {
            let existing: Option<i32> = conn
                .query_row(
                    "SELECT commit_number FROM commits WHERE git_hash = ?1",
                    params![git_hash],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(sql_err(other)),
                })?;
            if let Some(n) = existing {
                return Ok(CommitNumber(n));
            }
            // The writer mutex serializes appends, so MAX+1 is race-free.
            let n: i32 = conn
                .query_row(
                    "INSERT INTO commits (commit_number, git_hash, commit_time, author, subject)
                     VALUES ((SELECT COALESCE(MAX(commit_number) + 1, 0) FROM commits),
                             ?1, ?2, ?3, ?4)
                     RETURNING commit_number",
                    params![git_hash, commit_time, author, subject],
                    |r| r.get(0),
                )
                .map_err(sql_err)?;
            Ok(CommitNumber(n))
        })
    }

    /// The commit number for a git hash.
    pub fn number_of(&self, git_hash: &str) -> Result<CommitNumber> {
        self.db.with_reader(|conn| {
            conn.query_row(
                "SELECT commit_number FROM commits WHERE git_hash = ?1",
                params![git_hash],
                |r| r.get(0),
            )
            .map(CommitNumber)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    PerfError::not_found(format!("unknown commit {git_hash}"))
                }
                other => sql_err(other),
            })
        })
    }

    /// Full metadata for a commit number.
    pub fn details(&self, commit: CommitNumber) -> Result<CommitDetail> {
        self.db.with_reader(|conn| {
            conn.query_row(
                "SELECT commit_number, git_hash, commit_time, author, subject
                 FROM commits WHERE commit_number = ?1",
                params![commit.0],
                |r| {
                    Ok(CommitDetail {
                        commit_number: CommitNumber(r.get(0)?),
                        git_hash: r.get(1)?,
                        commit_time: r.get(2)?,
                        author: r.get(3)?,
                        subject: r.get(4)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    PerfError::not_found(format!("no commit number {}", commit.0))
                }
                other => sql_err(other),
            })
        })
    }

    /// The most recent commit at or before the given time. The zero time
    /// yields the most recent commit overall. An empty index is `NotFound`.
    pub fn number_at_or_before(&self, time: i64) -> Result<CommitNumber> {
        if time <= 0 {
            return self.latest();
        }
        self.db.with_reader(|conn| {
            let n: Option<i32> = conn
                .query_row(
                    "SELECT MAX(commit_number) FROM commits WHERE commit_time <= ?1",
                    params![time],
                    |r| r.get(0),
                )
                .map_err(sql_err)?;
            n.map(CommitNumber)
                .ok_or_else(|| PerfError::not_found(format!("no commit at or before {time}")))
        })
    }

    /// All commit numbers with `t0 <= commit_time <= t1`, ascending.
    pub fn commits_in_time_range(&self, t0: i64, t1: i64) -> Result<Vec<CommitNumber>> {
        self.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT commit_number FROM commits
                     WHERE commit_time >= ?1 AND commit_time <= ?2
                     ORDER BY commit_number",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![t0, t1], |r| r.get::<_, i32>(0))
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(CommitNumber(row.map_err(sql_err)?));
            }
            Ok(out)
        })
    }

    /// The highest commit number in the index.
    pub fn latest(&self) -> Result<CommitNumber> {
        self.db.with_reader(|conn| {
            let n: Option<i32> = conn
                .query_row("SELECT MAX(commit_number) FROM commits", [], |r| r.get(0))
                .map_err(sql_err)?;
            n.map(CommitNumber)
                .ok_or_else(|| PerfError::not_found("commit index is empty"))
        })
    }
}
