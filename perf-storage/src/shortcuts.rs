//! Shortcuts: persisted lists of trace keys referenced by id, so
//! regression records can recreate a chart without storing keys inline.

use std::sync::Arc;

use rusqlite::params;
use xxhash_rust::xxh3::xxh3_128;

use perf_core::errors::{PerfError, Result};

use crate::connection::{sql_err, DatabaseManager};

#[derive(Clone)]
pub struct ShortcutStore {
    db: Arc<DatabaseManager>,
}

impl ShortcutStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Deterministic id for a key set: digest of the sorted, deduplicated
    /// keys. The same set always yields the same id.
    pub fn id_for(keys: &[String]) -> String {
        let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        format!("{:032x}", xxh3_128(sorted.join("\n").as_bytes()))
    }

    /// Persist the key set if absent and return its id.
    pub fn insert_or_get(&self, keys: &[String]) -> Result<String> {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let id = Self::id_for(&sorted);
        let serialized = serde_json::to_string(&sorted)
            .map_err(|e| PerfError::invalid_input(format!("keys do not serialize: {e}")))?;
        self.db.with_writer(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO shortcuts (id, trace_keys) VALUES (?1, ?2)",
                params![id, serialized],
            )
            .map_err(sql_err)?;
            Ok(())
        })?;
        Ok(id)
    }

    /// The keys behind a shortcut id, sorted.
    pub fn get(&self, id: &str) -> Result<Vec<String>> {
        self.db.with_reader(|conn| {
            let serialized: String = conn
                .query_row(
                    "SELECT trace_keys FROM shortcuts WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        PerfError::not_found(format!("no shortcut {id}"))
                    }
                    other => sql_err(other),
                })?;
            serde_json::from_str(&serialized)
                .map_err(|e| PerfError::fatal(format!("corrupt shortcut {id}: {e}")))
        })
    }
}
