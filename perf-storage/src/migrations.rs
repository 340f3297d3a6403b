//! Schema migrations, gated on `PRAGMA user_version`.

use rusqlite::Connection;

use perf_core::errors::{PerfError, Result};

use crate::connection::sql_err;

/// v1: the full relational layout.
const V1: &str = r#"
CREATE TABLE IF NOT EXISTS trace_values (
    trace_id        BLOB    NOT NULL,
    commit_number   INTEGER NOT NULL,
    val             REAL    NOT NULL,
    source_file_id  INTEGER NOT NULL,
    PRIMARY KEY (trace_id, commit_number)
);
CREATE INDEX IF NOT EXISTS trace_values_by_commit
    ON trace_values (commit_number);

CREATE TABLE IF NOT EXISTS postings (
    tile_number  INTEGER NOT NULL,
    key_value    TEXT    NOT NULL,
    trace_id     BLOB    NOT NULL,
    PRIMARY KEY (tile_number, key_value, trace_id)
);
CREATE INDEX IF NOT EXISTS postings_by_trace
    ON postings (tile_number, trace_id);

CREATE TABLE IF NOT EXISTS paramsets (
    tile_number  INTEGER NOT NULL,
    key          TEXT    NOT NULL,
    value        TEXT    NOT NULL,
    PRIMARY KEY (tile_number, key, value)
);
CREATE INDEX IF NOT EXISTS paramsets_by_tile
    ON paramsets (tile_number DESC);

CREATE TABLE IF NOT EXISTS source_files (
    source_file_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    source_file     TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS commits (
    commit_number  INTEGER PRIMARY KEY,
    git_hash       TEXT UNIQUE NOT NULL,
    commit_time    INTEGER NOT NULL,
    author         TEXT NOT NULL,
    subject        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS commits_by_time
    ON commits (commit_time);

CREATE TABLE IF NOT EXISTS regressions (
    commit_number        INTEGER NOT NULL,
    alert_id             INTEGER NOT NULL,
    high                 TEXT,
    low                  TEXT,
    triage_high_status   TEXT NOT NULL DEFAULT 'untriaged',
    triage_high_message  TEXT NOT NULL DEFAULT '',
    triage_low_status    TEXT NOT NULL DEFAULT 'untriaged',
    triage_low_message   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (commit_number, alert_id)
);

CREATE TABLE IF NOT EXISTS alerts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    alert          TEXT NOT NULL,
    category       TEXT NOT NULL DEFAULT '',
    config_state   INTEGER NOT NULL DEFAULT 0,
    last_modified  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS shortcuts (
    id          TEXT PRIMARY KEY,
    trace_keys  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[&str] = &[V1];

/// Bring the database up to the latest schema version.
pub fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |r| r.get(0))
        .map_err(sql_err)?;
    for (idx, ddl) in MIGRATIONS.iter().enumerate() {
        let target = (idx + 1) as i64;
        if version >= target {
            continue;
        }
        conn.execute_batch(ddl).map_err(|e| PerfError::fatal(format!(
            "migration to v{target} failed: {e}"
        )))?;
        conn.pragma_update(None, "user_version", target)
            .map_err(sql_err)?;
    }
    Ok(())
}
