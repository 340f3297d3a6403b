//! `DatabaseManager`: read/write routing for the engine's SQLite database.
//!
//! Single write connection behind a mutex plus a small read pool, WAL
//! mode. This is the single owner of raw connections; no code outside
//! this crate touches a `&Connection` directly. All public store types
//! are safe for concurrent use through `with_reader` / `with_writer`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rusqlite::Connection;

use perf_core::errors::{PerfError, Result};

use crate::migrations;

const READ_POOL_SIZE: usize = 4;

/// Map a rusqlite error onto the engine's error kinds. Busy/locked and
/// I/O failures are retriable; constraint violations surface as
/// `Conflict` (normally absorbed by INSERT OR IGNORE).
pub(crate) fn sql_err(e: rusqlite::Error) -> PerfError {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => PerfError::not_found("no rows"),
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                PerfError::transient(e.to_string())
            }
            rusqlite::ErrorCode::ConstraintViolation => PerfError::conflict(e.to_string()),
            rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt => {
                PerfError::fatal(e.to_string())
            }
            _ => PerfError::transient(e.to_string()),
        },
        _ => PerfError::transient(e.to_string()),
    }
}

/// Owns the write connection and the read pool.
pub struct DatabaseManager {
    path: Option<PathBuf>,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl DatabaseManager {
    /// Open a file-backed database, run migrations, apply pragmas.
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path).map_err(sql_err)?;
        apply_pragmas(&writer)?;
        migrations::migrate(&writer)?;

        let mut readers = Vec::with_capacity(READ_POOL_SIZE);
        for _ in 0..READ_POOL_SIZE {
            // Plain read-write connections: a read-only open of a WAL
            // database fails until the -shm file exists. Writes still
            // route through `with_writer` only.
            let conn = Connection::open(path).map_err(sql_err)?;
            conn.busy_timeout(std::time::Duration::from_millis(5000))
                .map_err(sql_err)?;
            readers.push(Mutex::new(conn));
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Open an in-memory database (single connection; reads route to the
    /// writer). In-memory SQLite is per-connection, so this is only for
    /// single-process tests; multi-connection tests use a temp file.
    pub fn open_in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory().map_err(sql_err)?;
        writer
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(sql_err)?;
        migrations::migrate(&writer)?;
        Ok(Self {
            path: None,
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the write connection.
    pub fn with_writer<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|_| PerfError::fatal("writer lock poisoned"))?;
        f(&conn)
    }

    /// Run a closure against a pooled read connection.
    pub fn with_reader<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            return self.with_writer(f);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|_| PerfError::fatal("reader lock poisoned"))?;
        f(&conn)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(sql_err)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))
        .map_err(sql_err)?;
    Ok(())
}
