//! Trace-store integration tests against a file-backed database.
//!
//! File-backed temp directories because in-memory SQLite creates
//! isolated databases per connection (writer and read pool can't see
//! each other).

use std::sync::Arc;

use tempfile::TempDir;

use perf_core::cancel::CancellationToken;
use perf_core::config::StoreConfig;
use perf_core::params::Params;
use perf_core::query::Query;
use perf_core::tile::{is_missing, CommitNumber, TileNumber};
use perf_storage::{CommitStore, DatabaseManager, TraceStore};

fn temp_store() -> (TempDir, Arc<DatabaseManager>, TraceStore) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(DatabaseManager::open(&dir.path().join("perf.db")).unwrap());
    let store = TraceStore::new(Arc::clone(&db), &StoreConfig::default());
    (dir, db, store)
}

fn params_of(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Ingest-query-read: one write at commit 100 with tile size 256.
#[test]
fn ingest_query_read() {
    let (_dir, _db, store) = temp_store();
    let token = CancellationToken::new();
    let params = params_of(&[("arch", "x86"), ("config", "8888")]);
    store
        .write_batch(CommitNumber(100), &[(params.clone(), 1.25)], "gs://b/f1", &token)
        .unwrap();

    assert_eq!(store.latest_tile().unwrap(), TileNumber(0));
    assert_eq!(store.count_traces(TileNumber(0)).unwrap(), 1);

    let traces = store
        .query_traces(TileNumber(0), &Query::parse("arch=x86").unwrap())
        .unwrap();
    assert_eq!(traces.len(), 1);
    let (got_params, values) = &traces[0];
    assert_eq!(got_params, &params);
    assert_eq!(values.len(), 256);
    for (i, &v) in values.iter().enumerate() {
        if i == 100 {
            assert_eq!(v, 1.25);
        } else {
            assert!(is_missing(v), "index {i} should be missing");
        }
    }

    assert_eq!(
        store
            .get_source(CommitNumber(100), ",arch=x86,config=8888,")
            .unwrap(),
        "gs://b/f1"
    );
}

/// Cross-tile isolation: the same trace written in two tiles stays
/// separate per tile.
#[test]
fn cross_tile_isolation() {
    let (_dir, _db, store) = temp_store();
    let token = CancellationToken::new();
    let params = params_of(&[("arch", "x86")]);
    store
        .write_batch(CommitNumber(100), &[(params.clone(), 1.0)], "gs://b/f1", &token)
        .unwrap();
    store
        .write_batch(CommitNumber(300), &[(params.clone(), 2.0)], "gs://b/f2", &token)
        .unwrap();

    assert_eq!(store.latest_tile().unwrap(), TileNumber(1));
    let query = Query::parse("arch=x86").unwrap();

    let tile0 = store.query_traces(TileNumber(0), &query).unwrap();
    assert_eq!(tile0[0].1[100], 1.0);
    // Commit 300 lives in tile 1 at offset 300 - 256.
    assert!(is_missing(tile0[0].1[300 - 256]));

    let tile1 = store.query_traces(TileNumber(1), &query).unwrap();
    assert_eq!(tile1[0].1[300 - 256], 2.0);
    assert!(is_missing(tile1[0].1[100]));
}

/// After two writes with identical paramsets, the second write issues no
/// further paramset or posting inserts.
#[test]
fn paramset_cache_suppresses_repeat_inserts() {
    let (_dir, _db, store) = temp_store();
    let token = CancellationToken::new();
    let batch = vec![
        (params_of(&[("arch", "x86"), ("config", "8888")]), 1.0),
        (params_of(&[("arch", "x86"), ("config", "565")]), 2.0),
    ];
    store
        .write_batch(CommitNumber(10), &batch, "gs://b/f1", &token)
        .unwrap();
    let first = store.stats();
    // arch=x86, config=8888, config=565.
    assert_eq!(first.paramset_rows, 3);
    assert_eq!(first.posting_rows, 4);

    store
        .write_batch(CommitNumber(11), &batch, "gs://b/f2", &token)
        .unwrap();
    let second = store.stats();
    assert_eq!(second.paramset_rows, first.paramset_rows);
    assert_eq!(second.posting_rows, first.posting_rows);
    assert_eq!(second.value_rows, first.value_rows + 2);
}

/// Concurrent ingesters writing overlapping batches never conflict, and
/// the paramset ends up the union of everything written.
#[test]
fn concurrent_writers_union() {
    let (_dir, _db, store) = temp_store();
    let mut handles = Vec::new();
    for w in 0..4 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            let token = CancellationToken::new();
            for c in 0..20 {
                let batch = vec![
                    (params_of(&[("arch", "x86"), ("test", "shared")]), 1.0),
                    (
                        params_of(&[("arch", "x86"), ("test", &format!("w{w}"))]),
                        w as f32,
                    ),
                ];
                store
                    .write_batch(CommitNumber(c), &batch, &format!("gs://b/w{w}-{c}"), &token)
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // 1 shared + 4 per-writer traces.
    assert_eq!(store.count_traces(TileNumber(0)).unwrap(), 5);
    let paramset = store.ordered_paramset(TileNumber(0)).unwrap();
    let tests = paramset.values_for("test").unwrap();
    assert_eq!(tests.len(), 5);
    assert!(paramset.contains("test", "shared"));

    // Every cell of the shared trace is 1.0 for commits 0..20.
    let traces = store
        .query_traces(TileNumber(0), &Query::parse("test=shared").unwrap())
        .unwrap();
    assert_eq!(traces.len(), 1);
    for c in 0..20 {
        assert_eq!(traces[0].1[c], 1.0);
    }
}

/// The commit index and trace store agree through the shared database.
#[test]
fn commit_index_alongside_traces() {
    let (_dir, db, store) = temp_store();
    let commits = CommitStore::new(db);
    let token = CancellationToken::new();

    for (i, hash) in ["aaa", "bbb", "ccc"].iter().enumerate() {
        let n = commits
            .append(hash, 1000 + i as i64 * 100, "dev@x", "subject")
            .unwrap();
        assert_eq!(n, CommitNumber(i as i32));
        store
            .write_batch(n, &[(params_of(&[("arch", "x86")]), i as f32)], "gs://b/f", &token)
            .unwrap();
    }

    assert_eq!(store.recent_commits_with_data(2).unwrap(), vec![
        CommitNumber(2),
        CommitNumber(1)
    ]);
    assert_eq!(commits.number_at_or_before(1150).unwrap(), CommitNumber(1));
}
