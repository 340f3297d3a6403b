//! Alert persistence. Alerts are user-authored and mutable; the
//! continuous loop reads the active set each sweep.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::params;

use perf_core::alert::Alert;
use perf_core::errors::{PerfError, Result};

use crate::connection::{sql_err, DatabaseManager};

const STATE_ACTIVE: i64 = 0;
const STATE_DELETED: i64 = 1;

#[derive(Clone)]
pub struct AlertStore {
    db: Arc<DatabaseManager>,
}

impl AlertStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Save an alert, assigning an id on first save. The stored record is
    /// re-activated if it was soft-deleted.
    pub fn save(&self, alert: &mut Alert) -> Result<i64> {
        alert.validate()?;
        let now = unix_now();
        if !alert.id_is_set() {
            let id = self.db.with_writer(|conn| {
                conn.query_row(
                    "INSERT INTO alerts (alert, category, config_state, last_modified)
                     VALUES ('', ?1, ?2, ?3) RETURNING id",
                    params![alert.category, STATE_ACTIVE, now],
                    |r| r.get::<_, i64>(0),
                )
                .map_err(sql_err)
            })?;
            alert.id = id;
        }
        let serialized = serde_json::to_string(alert)
            .map_err(|e| PerfError::invalid_input(format!("alert does not serialize: {e}")))?;
        self.db.with_writer(|conn| {
            conn.execute(
                "INSERT INTO alerts (id, alert, category, config_state, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET
                     alert = excluded.alert,
                     category = excluded.category,
                     config_state = excluded.config_state,
                     last_modified = excluded.last_modified",
                params![alert.id, serialized, alert.category, STATE_ACTIVE, now],
            )
            .map_err(sql_err)?;
            Ok(())
        })?;
        Ok(alert.id)
    }

    pub fn get(&self, id: i64) -> Result<Alert> {
        self.db.with_reader(|conn| {
            let serialized: String = conn
                .query_row(
                    "SELECT alert FROM alerts WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        PerfError::not_found(format!("no alert {id}"))
                    }
                    other => sql_err(other),
                })?;
            serde_json::from_str(&serialized)
                .map_err(|e| PerfError::fatal(format!("corrupt alert {id}: {e}")))
        })
    }

    /// All alerts the continuous loop should scan, ordered by id.
    pub fn list_active(&self) -> Result<Vec<Alert>> {
        self.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT alert FROM alerts WHERE config_state = ?1 ORDER BY id",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![STATE_ACTIVE], |r| r.get::<_, String>(0))
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for row in rows {
                let serialized = row.map_err(sql_err)?;
                out.push(
                    serde_json::from_str(&serialized)
                        .map_err(|e| PerfError::fatal(format!("corrupt alert: {e}")))?,
                );
            }
            Ok(out)
        })
    }

    /// Soft-delete: the alert disappears from the active list but its id
    /// stays valid for existing regression records.
    pub fn delete(&self, id: i64) -> Result<()> {
        self.db.with_writer(|conn| {
            let affected = conn
                .execute(
                    "UPDATE alerts SET config_state = ?2, last_modified = ?3 WHERE id = ?1",
                    params![id, STATE_DELETED, unix_now()],
                )
                .map_err(sql_err)?;
            if affected == 0 {
                return Err(PerfError::not_found(format!("no alert {id}")));
            }
            Ok(())
        })
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
