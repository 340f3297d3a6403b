//! The source catalogue: interning of ingested file URIs.

use std::sync::Arc;

use rusqlite::params;

use perf_core::errors::{PerfError, Result};

use crate::connection::{sql_err, DatabaseManager};

#[derive(Clone)]
pub struct SourceStore {
    db: Arc<DatabaseManager>,
}

impl SourceStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Return the stable id for a URI. Insert-if-absent then select under
    /// the unique constraint, so concurrent calls for the same URI agree.
    pub fn intern(&self, uri: &str) -> Result<i64> {
        self.db.with_writer(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO source_files (source_file) VALUES (?1)",
                params![uri],
            )
            .map_err(sql_err)?;
            conn.query_row(
                "SELECT source_file_id FROM source_files WHERE source_file = ?1",
                params![uri],
                |r| r.get(0),
            )
            .map_err(sql_err)
        })
    }

    /// The URI behind an id.
    pub fn uri_of(&self, id: i64) -> Result<String> {
        self.db.with_reader(|conn| {
            conn.query_row(
                "SELECT source_file FROM source_files WHERE source_file_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    PerfError::not_found(format!("no source file id {id}"))
                }
                other => sql_err(other),
            })
        })
    }
}
