//! The ingestion pipeline: pull file-arrival events, fetch and parse the
//! files, write them into the trace store, and acknowledge with
//! at-least-once discipline: nack only on transient failure, so nacks
//! are the single redelivery path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use perf_core::cancel::CancellationToken;
use perf_core::config::IngestConfig;
use perf_core::errors::{PerfError, Result};
use perf_core::traits::{Delivery, EventSource, ObjectStore, Publisher};
use perf_storage::{CommitStore, TraceStore};

use crate::events::{FileEvent, IngestedEvent};
use crate::format;

/// How a processed delivery is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Success or permanent failure: consume the event.
    Ack,
    /// Transient failure: request redelivery.
    Nack,
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub ingested: AtomicU64,
    pub skipped: AtomicU64,
    pub parse_failures: AtomicU64,
    pub nacked: AtomicU64,
}

/// Cheaply cloneable; clones share stores, stats, and the token.
#[derive(Clone)]
pub struct Pipeline {
    store: TraceStore,
    commits: CommitStore,
    object_store: Arc<dyn ObjectStore>,
    publisher: Option<Arc<dyn Publisher>>,
    config: IngestConfig,
    token: CancellationToken,
    stats: Arc<IngestStats>,
}

impl Pipeline {
    pub fn new(
        store: TraceStore,
        commits: CommitStore,
        object_store: Arc<dyn ObjectStore>,
        publisher: Option<Arc<dyn Publisher>>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            commits,
            object_store,
            publisher,
            config,
            token: CancellationToken::new(),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Pump the event source until it closes or the pipeline is
    /// cancelled. Deliveries fan out to a bounded worker pool.
    pub fn run(&self, source: &dyn EventSource) -> Result<()> {
        let (tx, rx) = bounded::<Delivery>(self.config.effective_channel_bound());
        let mut workers = Vec::new();
        for i in 0..self.config.effective_workers() {
            let pipeline = self.clone();
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("perf-ingest-{i}"))
                .spawn(move || {
                    for delivery in rx.iter() {
                        pipeline.handle(delivery);
                    }
                })
                .map_err(|e| PerfError::fatal(format!("spawn ingest worker: {e}")))?;
            workers.push(handle);
        }
        drop(rx);

        let result = loop {
            if self.token.is_cancelled() {
                break Ok(());
            }
            match source.pull() {
                Ok(Some(delivery)) => {
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    if tx.send(delivery).is_err() {
                        break Err(PerfError::fatal("ingest workers gone"));
                    }
                }
                Ok(None) => break Ok(()), // source closed; drain and stop
                Err(e) if e.is_transient() => {
                    warn!("event source hiccup: {e}");
                }
                Err(e) => break Err(e),
            }
        };

        drop(tx);
        for handle in workers {
            let _ = handle.join();
        }
        info!(
            ingested = self.stats.ingested.load(Ordering::Relaxed),
            skipped = self.stats.skipped.load(Ordering::Relaxed),
            "ingestion stopped"
        );
        result
    }

    fn handle(&self, delivery: Delivery) {
        match self.process(&delivery.payload) {
            Outcome::Ack => delivery.acker.ack(),
            Outcome::Nack => {
                self.stats.nacked.fetch_add(1, Ordering::Relaxed);
                delivery.acker.nack();
            }
        }
    }

    /// Decide the fate of one delivery. Every permanent failure acks
    /// (poison-pill policy); only transient failures nack.
    pub fn process(&self, payload: &[u8]) -> Outcome {
        let event = match FileEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed event: {e}");
                return Outcome::Ack;
            }
        };
        let uri = event.uri();

        let prefixes = &self.config.accepted_prefixes;
        if !prefixes.is_empty() && !prefixes.iter().any(|p| uri.starts_with(p.as_str())) {
            debug!(%uri, "outside accepted prefixes");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Outcome::Ack;
        }

        let data = match self.object_store.fetch(&event.bucket, &event.name) {
            Ok(data) => data,
            Err(e) if e.is_transient() => {
                warn!(%uri, "transient fetch failure: {e}");
                return Outcome::Nack;
            }
            Err(e) => {
                warn!(%uri, "dropping unfetchable file: {e}");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return Outcome::Ack;
            }
        };

        let parsed = match format::parse(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%uri, "unparseable file: {e}");
                self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                return Outcome::Ack;
            }
        };
        if parsed.samples.is_empty() {
            debug!(%uri, "file carries no samples");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Outcome::Ack;
        }

        let branches = &self.config.branches;
        if !branches.is_empty() {
            if let Some(branch) = parsed.key.get("branch") {
                if !branches.iter().any(|b| b == branch) {
                    debug!(%uri, %branch, "branch not accepted");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    return Outcome::Ack;
                }
            }
        }

        let commit = match self.commits.number_of(&parsed.git_hash) {
            Ok(commit) => commit,
            Err(PerfError::NotFound { .. }) => {
                // The index will not retroactively learn old commits.
                debug!(%uri, git_hash = %parsed.git_hash, "unknown commit");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return Outcome::Ack;
            }
            Err(e) if e.is_transient() => {
                warn!(%uri, "transient commit lookup failure: {e}");
                return Outcome::Nack;
            }
            Err(e) => {
                warn!(%uri, "dropping file on commit lookup: {e}");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return Outcome::Ack;
            }
        };

        match self.store.write_batch(commit, &parsed.samples, &uri, &self.token) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(%uri, "transient store failure: {e}");
                return Outcome::Nack;
            }
            Err(e) => {
                warn!(%uri, "dropping file on store failure: {e}");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return Outcome::Ack;
            }
        }
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);

        // Fire-and-forget; a publish failure never blocks the ack.
        if let Some(publisher) = &self.publisher {
            let ingested = IngestedEvent {
                bucket: event.bucket,
                name: event.name,
                git_hash: parsed.git_hash,
                commit_number: commit,
            };
            match serde_json::to_vec(&ingested) {
                Ok(payload) => {
                    if let Err(e) = publisher.publish(&payload) {
                        warn!(%uri, "ingested-event publish failed: {e}");
                    }
                }
                Err(e) => warn!(%uri, "ingested-event does not serialize: {e}"),
            }
        }
        Outcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use perf_core::config::StoreConfig;
    use perf_core::tile::TileNumber;
    use perf_storage::DatabaseManager;

    struct FakeObjectStore {
        objects: HashMap<(String, String), Vec<u8>>,
        transient: bool,
    }

    impl ObjectStore for FakeObjectStore {
        fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
            if self.transient {
                return Err(PerfError::transient("fetch flake"));
            }
            self.objects
                .get(&(bucket.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| PerfError::not_found("no such object"))
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, payload: &[u8]) -> Result<()> {
            self.published.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn v1_file(git_hash: &str, branch: Option<&str>) -> Vec<u8> {
        let mut key = serde_json::json!({"arch": "x86"});
        if let Some(branch) = branch {
            key["branch"] = serde_json::Value::String(branch.to_string());
        }
        serde_json::to_vec(&serde_json::json!({
            "version": 1,
            "git_hash": git_hash,
            "key": key,
            "results": [{"key": {"test": "draw"}, "measurement": 1.25}]
        }))
        .unwrap()
    }

    struct Fixture {
        pipeline: Pipeline,
        store: TraceStore,
        publisher: Arc<RecordingPublisher>,
    }

    fn fixture(objects: Vec<(&str, Vec<u8>)>, transient: bool, branches: Vec<String>) -> Fixture {
        let db = Arc::new(DatabaseManager::open_in_memory().unwrap());
        let store = TraceStore::new(Arc::clone(&db), &StoreConfig::default());
        let commits = CommitStore::new(db);
        commits.append("abc", 100, "a@x", "s").unwrap();
        let object_store = Arc::new(FakeObjectStore {
            objects: objects
                .into_iter()
                .map(|(name, data)| (("b".to_string(), name.to_string()), data))
                .collect(),
            transient,
        });
        let publisher = Arc::new(RecordingPublisher::default());
        let config = IngestConfig { branches, ..IngestConfig::default() };
        let pipeline = Pipeline::new(
            store.clone(),
            commits,
            object_store,
            Some(Arc::clone(&publisher) as Arc<dyn Publisher>),
            config,
        );
        Fixture { pipeline, store, publisher }
    }

    #[test]
    fn happy_path_ingests_and_publishes() {
        let f = fixture(vec![("f.json", v1_file("abc", None))], false, vec![]);
        let outcome = f.pipeline.process(br#"{"bucket": "b", "name": "f.json"}"#);
        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(f.store.count_traces(TileNumber(0)).unwrap(), 1);
        assert_eq!(
            f.store
                .get_source(perf_core::tile::CommitNumber(0), ",arch=x86,test=draw,")
                .unwrap(),
            "gs://b/f.json"
        );
        let published = f.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let event: IngestedEvent = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(event.git_hash, "abc");
        assert_eq!(event.commit_number.0, 0);
    }

    #[test]
    fn rejected_branch_is_acked_without_writes() {
        let f = fixture(
            vec![("f.json", v1_file("abc", Some("experimental")))],
            false,
            vec!["main".to_string()],
        );
        let outcome = f.pipeline.process(br#"{"bucket": "b", "name": "f.json"}"#);
        assert_eq!(outcome, Outcome::Ack);
        // Parsed fine, but nothing reached the trace store.
        assert!(f.store.latest_tile().is_err());
        assert_eq!(f.pipeline.stats().skipped.load(Ordering::Relaxed), 1);
        assert_eq!(f.pipeline.stats().parse_failures.load(Ordering::Relaxed), 0);
        assert!(f.publisher.published.lock().unwrap().is_empty());
    }

    #[test]
    fn accepted_branch_passes_the_filter() {
        let f = fixture(
            vec![("f.json", v1_file("abc", Some("main")))],
            false,
            vec!["main".to_string()],
        );
        assert_eq!(
            f.pipeline.process(br#"{"bucket": "b", "name": "f.json"}"#),
            Outcome::Ack
        );
        assert_eq!(f.store.count_traces(TileNumber(0)).unwrap(), 1);
    }

    #[test]
    fn transient_fetch_failure_nacks() {
        let f = fixture(vec![("f.json", v1_file("abc", None))], true, vec![]);
        let outcome = f.pipeline.process(br#"{"bucket": "b", "name": "f.json"}"#);
        assert_eq!(outcome, Outcome::Nack);
        assert!(f.store.latest_tile().is_err());
    }

    #[test]
    fn permanent_failures_ack() {
        // Malformed event.
        let f = fixture(vec![], false, vec![]);
        assert_eq!(f.pipeline.process(b"garbage"), Outcome::Ack);
        // Unfetchable object.
        assert_eq!(
            f.pipeline.process(br#"{"bucket": "b", "name": "missing.json"}"#),
            Outcome::Ack
        );
        // Unparseable file.
        let f = fixture(vec![("bad.json", b"not json".to_vec())], false, vec![]);
        assert_eq!(
            f.pipeline.process(br#"{"bucket": "b", "name": "bad.json"}"#),
            Outcome::Ack
        );
        assert_eq!(f.pipeline.stats().parse_failures.load(Ordering::Relaxed), 1);
        // Unknown commit.
        let f = fixture(vec![("f.json", v1_file("zzz", None))], false, vec![]);
        assert_eq!(
            f.pipeline.process(br#"{"bucket": "b", "name": "f.json"}"#),
            Outcome::Ack
        );
        assert!(f.store.latest_tile().is_err());
    }

    #[test]
    fn prefix_filter_acks_outsiders() {
        let f = fixture(vec![("f.json", v1_file("abc", None))], false, vec![]);
        let mut pipeline = f.pipeline.clone();
        pipeline.config.accepted_prefixes = vec!["gs://other-bucket/".to_string()];
        assert_eq!(
            pipeline.process(br#"{"bucket": "b", "name": "f.json"}"#),
            Outcome::Ack
        );
        assert!(f.store.latest_tile().is_err());
    }
}
