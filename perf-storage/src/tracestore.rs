//! The trace store: (trace_id, commit_number) → value, plus the per-tile
//! inverted index and paramset that make structured queries work.
//!
//! Write path: every batch interns its source URI, then upserts novel
//! paramset entries, novel postings, and the trace values, all with
//! INSERT OR IGNORE so concurrent ingesters never produce duplicates or
//! errors. Two advisory in-process caches (postings, paramset entries)
//! suppress repeat index writes; correctness never depends on them.
//!
//! Read path: a query is planned against the tile's paramset into
//! OR-groups of postings, trace ids are intersected across groups, and
//! values are read per tile as dense sentinel-filled vectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use moka::sync::Cache;
use rusqlite::params;
use rusqlite::types::Value;
use rusqlite::Connection;

use perf_core::cancel::CancellationToken;
use perf_core::config::StoreConfig;
use perf_core::errors::{PerfError, Result};
use perf_core::params::{structured_key, Params, TraceId};
use perf_core::paramset::{ParamSet, ReadOnlyParamSet};
use perf_core::query::{OrGroup, Query};
use perf_core::tile::{new_trace, offset_in_tile, tile_for_commit, CommitNumber, TileNumber};

use crate::connection::{sql_err, DatabaseManager};
use crate::sources::SourceStore;

/// Chunk sizes keep single statements below back-end limits.
const VALUE_CHUNK: usize = 100;
const INDEX_CHUNK: usize = 25;

const POSTING_CACHE_CAPACITY: u64 = 10_000_000;
const PARAMSET_CACHE_CAPACITY: u64 = 10_000_000;
const ORDERED_PARAMSET_CAPACITY: u64 = 100;
const ORDERED_PARAMSET_TTL: Duration = Duration::from_secs(5 * 60);

const IDS_CHANNEL_BOUND: usize = 1000;

/// Counters of rows actually sent to the database. The index counters
/// only move on cache misses, which is what the write-suppression tests
/// observe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteStats {
    pub value_rows: u64,
    pub posting_rows: u64,
    pub paramset_rows: u64,
    pub batches: u64,
}

struct Inner {
    db: Arc<DatabaseManager>,
    sources: SourceStore,
    tile_size: i32,
    write_budget: Duration,
    /// Presence of `(tile, trace_id)` means every posting of that trace
    /// is already written for that tile.
    posting_cache: Cache<(i32, TraceId), ()>,
    /// Presence of `(tile, key, value)` means that paramset entry is
    /// already written.
    paramset_cache: Cache<(i32, String, String), ()>,
    ordered_paramset_cache: Cache<i32, Arc<ReadOnlyParamSet>>,
    value_rows: AtomicU64,
    posting_rows: AtomicU64,
    paramset_rows: AtomicU64,
    batches: AtomicU64,
}

/// Cheaply cloneable handle; all clones share connections and caches.
#[derive(Clone)]
pub struct TraceStore {
    inner: Arc<Inner>,
}

impl TraceStore {
    pub fn new(db: Arc<DatabaseManager>, config: &StoreConfig) -> Self {
        let sources = SourceStore::new(Arc::clone(&db));
        Self {
            inner: Arc::new(Inner {
                db,
                sources,
                tile_size: config.effective_tile_size(),
                write_budget: Duration::from_secs(config.effective_write_budget_secs()),
                posting_cache: Cache::new(POSTING_CACHE_CAPACITY),
                paramset_cache: Cache::new(PARAMSET_CACHE_CAPACITY),
                ordered_paramset_cache: Cache::builder()
                    .max_capacity(ORDERED_PARAMSET_CAPACITY)
                    .time_to_live(ORDERED_PARAMSET_TTL)
                    .build(),
                value_rows: AtomicU64::new(0),
                posting_rows: AtomicU64::new(0),
                paramset_rows: AtomicU64::new(0),
                batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn tile_size(&self) -> i32 {
        self.inner.tile_size
    }

    /// Snapshot of the write counters.
    pub fn stats(&self) -> WriteStats {
        WriteStats {
            value_rows: self.inner.value_rows.load(Ordering::Relaxed),
            posting_rows: self.inner.posting_rows.load(Ordering::Relaxed),
            paramset_rows: self.inner.paramset_rows.load(Ordering::Relaxed),
            batches: self.inner.batches.load(Ordering::Relaxed),
        }
    }

    /// Write one logical batch of measurements taken at a commit.
    ///
    /// Repeated delivery of the same batch is an idempotent no-op; two
    /// racing writers on the same `(trace_id, commit_number)` keep the
    /// first value, while index and paramset effects are union semantics.
    pub fn write_batch(
        &self,
        commit: CommitNumber,
        batch: &[(Params, f32)],
        source_uri: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.inner.write_budget;
        let tile = tile_for_commit(commit, self.inner.tile_size);
        let source_id = self.inner.sources.intern(source_uri)?;

        let mut value_rows: Vec<(TraceId, f32)> = Vec::with_capacity(batch.len());
        let mut new_paramset: Vec<(String, String)> = Vec::new();
        let mut seen_pairs: BTreeSet<(&str, &str)> = BTreeSet::new();
        let mut new_postings: Vec<(TraceId, String)> = Vec::new();
        let mut new_traces: BTreeSet<TraceId> = BTreeSet::new();

        for (params, value) in batch {
            let key = structured_key(params)?;
            let id = TraceId::from_structured_key(&key);
            value_rows.push((id, *value));

            for (k, v) in params {
                if seen_pairs.insert((k.as_str(), v.as_str()))
                    && self
                        .inner
                        .paramset_cache
                        .get(&(tile.0, k.clone(), v.clone()))
                        .is_none()
                {
                    new_paramset.push((k.clone(), v.clone()));
                }
            }

            if self.inner.posting_cache.get(&(tile.0, id)).is_none() && new_traces.insert(id) {
                for (k, v) in params {
                    new_postings.push((id, format!("{k}={v}")));
                }
            }
        }

        for chunk in new_paramset.chunks(INDEX_CHUNK) {
            self.check_budget(deadline, token)?;
            self.inner
                .db
                .with_writer(|conn| insert_paramset_chunk(conn, tile, chunk))?;
            self.inner
                .paramset_rows
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            for (k, v) in chunk {
                self.inner
                    .paramset_cache
                    .insert((tile.0, k.clone(), v.clone()), ());
            }
        }
        if !new_paramset.is_empty() {
            self.inner.ordered_paramset_cache.invalidate(&tile.0);
        }

        for chunk in new_postings.chunks(INDEX_CHUNK) {
            self.check_budget(deadline, token)?;
            self.inner
                .db
                .with_writer(|conn| insert_postings_chunk(conn, tile, chunk))?;
            self.inner
                .posting_rows
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        // Only mark a trace once every one of its postings is written.
        for id in &new_traces {
            self.inner.posting_cache.insert((tile.0, *id), ());
        }

        for chunk in value_rows.chunks(VALUE_CHUNK) {
            self.check_budget(deadline, token)?;
            self.inner
                .db
                .with_writer(|conn| insert_values_chunk(conn, commit, source_id, chunk))?;
            self.inner
                .value_rows
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }

        self.inner.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check_budget(&self, deadline: Instant, token: &CancellationToken) -> Result<()> {
        token.check()?;
        if Instant::now() > deadline {
            return Err(PerfError::transient("write budget exceeded"));
        }
        Ok(())
    }

    /// All traces in a tile matching the query, in trace-id order, each a
    /// dense tile-length vector in commit-number order.
    pub fn query_traces(
        &self,
        tile: TileNumber,
        query: &Query,
    ) -> Result<Vec<(Params, Vec<f32>)>> {
        let paramset = self.ordered_paramset(tile)?;
        let Some(plan) = query.plan(&paramset) else {
            return Ok(Vec::new());
        };
        let ids = self.ids_for_plan(tile, &plan)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let params = self.params_of(tile, id)?;
            let values = self.values_in_tile(tile, id)?;
            out.push((params, values));
        }
        Ok(out)
    }

    /// Like `query_traces` but without value reads: streams the matching
    /// parameter maps through a bounded channel.
    pub fn query_trace_ids_only(
        &self,
        tile: TileNumber,
        query: &Query,
        token: &CancellationToken,
    ) -> Result<Receiver<Result<Params>>> {
        let paramset = self.ordered_paramset(tile)?;
        let plan = query.plan(&paramset);
        let (tx, rx) = bounded(IDS_CHANNEL_BOUND);
        let Some(groups) = plan else {
            return Ok(rx); // tx dropped: empty stream
        };
        let store = self.clone();
        let token = token.clone();
        std::thread::Builder::new()
            .name("perf-trace-ids".to_string())
            .spawn(move || {
                let ids = match store.ids_for_plan(tile, &groups) {
                    Ok(ids) => ids,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                for id in ids {
                    if token.is_cancelled() {
                        let _ = tx.send(Err(PerfError::Cancelled));
                        return;
                    }
                    match store.params_of(tile, id) {
                        Ok(p) => {
                            if tx.send(Ok(p)).is_err() {
                                return; // receiver gone
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
            })
            .map_err(|e| PerfError::fatal(format!("spawn trace-ids thread: {e}")))?;
        Ok(rx)
    }

    /// Direct value lookup for known trace names.
    pub fn read_traces(
        &self,
        tile: TileNumber,
        names: &[String],
    ) -> Result<BTreeMap<String, Vec<f32>>> {
        let mut out = BTreeMap::new();
        for name in names {
            let id = TraceId::from_structured_key(name);
            out.insert(name.clone(), self.values_in_tile(tile, id)?);
        }
        Ok(out)
    }

    /// The tile's paramset with keys in stable order. Cached with a small
    /// LRU and a ~5 minute TTL; writes to the tile invalidate it early.
    pub fn ordered_paramset(&self, tile: TileNumber) -> Result<Arc<ReadOnlyParamSet>> {
        if let Some(ps) = self.inner.ordered_paramset_cache.get(&tile.0) {
            return Ok(ps);
        }
        let mut paramset = ParamSet::new();
        self.inner.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT key, value FROM paramsets WHERE tile_number = ?1")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![tile.0], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })
                .map_err(sql_err)?;
            for row in rows {
                let (k, v) = row.map_err(sql_err)?;
                paramset.add(&k, &v);
            }
            Ok(())
        })?;
        let frozen = Arc::new(paramset.freeze());
        self.inner
            .ordered_paramset_cache
            .insert(tile.0, Arc::clone(&frozen));
        Ok(frozen)
    }

    /// Number of distinct traces present in a tile.
    pub fn count_traces(&self, tile: TileNumber) -> Result<i64> {
        self.inner.db.with_reader(|conn| {
            conn.query_row(
                "SELECT COUNT(DISTINCT trace_id) FROM postings WHERE tile_number = ?1",
                params![tile.0],
                |r| r.get(0),
            )
            .map_err(sql_err)
        })
    }

    /// The URI of the file that delivered the value at a commit.
    pub fn get_source(&self, commit: CommitNumber, trace_name: &str) -> Result<String> {
        let id = TraceId::from_structured_key(trace_name);
        self.inner.db.with_reader(|conn| {
            conn.query_row(
                "SELECT sf.source_file
                 FROM trace_values tv
                 JOIN source_files sf ON sf.source_file_id = tv.source_file_id
                 WHERE tv.trace_id = ?1 AND tv.commit_number = ?2",
                params![id.as_bytes().as_slice(), commit.0],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => PerfError::not_found(format!(
                    "no source for {trace_name} at commit {}",
                    commit.0
                )),
                other => sql_err(other),
            })
        })
    }

    /// The highest tile number that has any paramset entry.
    pub fn latest_tile(&self) -> Result<TileNumber> {
        self.inner.db.with_reader(|conn| {
            let n: Option<i32> = conn
                .query_row("SELECT MAX(tile_number) FROM paramsets", [], |r| r.get(0))
                .map_err(sql_err)?;
            n.map(TileNumber)
                .ok_or_else(|| PerfError::not_found("no tiles"))
        })
    }

    /// The most recent `limit` commit numbers that carry any data,
    /// descending. Feeds the detector's candidate iteration.
    pub fn recent_commits_with_data(&self, limit: usize) -> Result<Vec<CommitNumber>> {
        self.inner.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT DISTINCT commit_number FROM trace_values
                     ORDER BY commit_number DESC LIMIT ?1",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![limit as i64], |r| r.get::<_, i32>(0))
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(CommitNumber(row.map_err(sql_err)?));
            }
            Ok(out)
        })
    }

    // ─── read internals ─────────────────────────────────────────────────

    fn ids_for_plan(&self, tile: TileNumber, groups: &[OrGroup]) -> Result<BTreeSet<TraceId>> {
        let mut acc: Option<BTreeSet<TraceId>> = None;
        for group in groups {
            let ids = self.ids_for_postings(tile, &group.postings)?;
            acc = Some(match acc {
                None => ids,
                Some(prev) => prev.intersection(&ids).copied().collect(),
            });
            if acc.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        Ok(acc.unwrap_or_default())
    }

    fn ids_for_postings(&self, tile: TileNumber, postings: &[String]) -> Result<BTreeSet<TraceId>> {
        self.inner.db.with_reader(|conn| {
            let mut sql = String::from(
                "SELECT DISTINCT trace_id FROM postings WHERE tile_number = ? AND key_value IN (",
            );
            let mut args: Vec<Value> = Vec::with_capacity(postings.len() + 1);
            args.push(Value::Integer(tile.0 as i64));
            for (i, p) in postings.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                args.push(Value::Text(p.clone()));
            }
            sql.push(')');

            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), |r| {
                    r.get::<_, Vec<u8>>(0)
                })
                .map_err(sql_err)?;
            let mut ids = BTreeSet::new();
            for row in rows {
                let bytes = row.map_err(sql_err)?;
                let bytes: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| PerfError::fatal("trace_id is not 16 bytes"))?;
                ids.insert(TraceId::from_bytes(bytes));
            }
            Ok(ids)
        })
    }

    fn params_of(&self, tile: TileNumber, id: TraceId) -> Result<Params> {
        self.inner.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT key_value FROM postings
                     WHERE tile_number = ?1 AND trace_id = ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![tile.0, id.as_bytes().as_slice()], |r| {
                    r.get::<_, String>(0)
                })
                .map_err(sql_err)?;
            let mut params = Params::new();
            for row in rows {
                let kv = row.map_err(sql_err)?;
                let (k, v) = kv
                    .split_once('=')
                    .ok_or_else(|| PerfError::fatal(format!("malformed posting {kv:?}")))?;
                params.insert(k.to_string(), v.to_string());
            }
            if params.is_empty() {
                return Err(PerfError::not_found(format!("trace {id} not in tile {}", tile.0)));
            }
            Ok(params)
        })
    }

    fn values_in_tile(&self, tile: TileNumber, id: TraceId) -> Result<Vec<f32>> {
        let tile_size = self.inner.tile_size;
        let first = tile.first_commit(tile_size).0;
        let last = tile.last_commit(tile_size).0;
        self.inner.db.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT commit_number, val FROM trace_values
                     WHERE trace_id = ?1 AND commit_number >= ?2 AND commit_number <= ?3",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![id.as_bytes().as_slice(), first, last], |r| {
                    Ok((r.get::<_, i32>(0)?, r.get::<_, f64>(1)?))
                })
                .map_err(sql_err)?;
            let mut values = new_trace(tile_size as usize);
            for row in rows {
                let (commit, val) = row.map_err(sql_err)?;
                values[offset_in_tile(CommitNumber(commit), tile_size)] = val as f32;
            }
            Ok(values)
        })
    }
}

// ─── chunked INSERT OR IGNORE helpers ───────────────────────────────────

fn insert_paramset_chunk(
    conn: &Connection,
    tile: TileNumber,
    rows: &[(String, String)],
) -> Result<()> {
    let mut sql = String::from("INSERT OR IGNORE INTO paramsets (tile_number, key, value) VALUES ");
    let mut args: Vec<Value> = Vec::with_capacity(rows.len() * 3);
    for (i, (k, v)) in rows.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("(?,?,?)");
        args.push(Value::Integer(tile.0 as i64));
        args.push(Value::Text(k.clone()));
        args.push(Value::Text(v.clone()));
    }
    conn.execute(&sql, rusqlite::params_from_iter(args))
        .map_err(sql_err)?;
    Ok(())
}

fn insert_postings_chunk(
    conn: &Connection,
    tile: TileNumber,
    rows: &[(TraceId, String)],
) -> Result<()> {
    let mut sql =
        String::from("INSERT OR IGNORE INTO postings (tile_number, key_value, trace_id) VALUES ");
    let mut args: Vec<Value> = Vec::with_capacity(rows.len() * 3);
    for (i, (id, kv)) in rows.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("(?,?,?)");
        args.push(Value::Integer(tile.0 as i64));
        args.push(Value::Text(kv.clone()));
        args.push(Value::Blob(id.as_bytes().to_vec()));
    }
    conn.execute(&sql, rusqlite::params_from_iter(args))
        .map_err(sql_err)?;
    Ok(())
}

fn insert_values_chunk(
    conn: &Connection,
    commit: CommitNumber,
    source_id: i64,
    rows: &[(TraceId, f32)],
) -> Result<()> {
    let mut sql = String::from(
        "INSERT OR IGNORE INTO trace_values (trace_id, commit_number, val, source_file_id) VALUES ",
    );
    let mut args: Vec<Value> = Vec::with_capacity(rows.len() * 4);
    for (i, (id, val)) in rows.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("(?,?,?,?)");
        args.push(Value::Blob(id.as_bytes().to_vec()));
        args.push(Value::Integer(commit.0 as i64));
        args.push(Value::Real(*val as f64));
        args.push(Value::Integer(source_id));
    }
    conn.execute(&sql, rusqlite::params_from_iter(args))
        .map_err(sql_err)?;
    Ok(())
}
