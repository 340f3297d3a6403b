//! The continuous scanning loop: a handful of paced scanner threads
//! sweeping the sliding commit window across every active alert.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use perf_core::cancel::CancellationToken;
use perf_core::config::LoopConfig;
use perf_core::errors::PerfError;
use perf_core::tile::CommitNumber;
use perf_storage::{AlertStore, RegressionStore, TraceStore};

use crate::detector::Detector;

/// Liveness counters exported by the loop.
#[derive(Debug, Default)]
pub struct Liveness {
    regressions_found: AtomicU64,
    clustering_latency_ms: AtomicU64,
    untriaged: AtomicI64,
    sweeps: AtomicU64,
}

impl Liveness {
    pub fn regressions_found(&self) -> u64 {
        self.regressions_found.load(Ordering::Relaxed)
    }

    /// Latency of the most recent detect pass, in milliseconds.
    pub fn clustering_latency_ms(&self) -> u64 {
        self.clustering_latency_ms.load(Ordering::Relaxed)
    }

    pub fn untriaged(&self) -> i64 {
        self.untriaged.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}

pub struct ContinuousLoop {
    detector: Detector,
    store: TraceStore,
    alerts: AlertStore,
    regressions: RegressionStore,
    config: LoopConfig,
    token: CancellationToken,
    liveness: Arc<Liveness>,
    handles: Vec<JoinHandle<()>>,
}

impl ContinuousLoop {
    pub fn new(
        detector: Detector,
        store: TraceStore,
        alerts: AlertStore,
        regressions: RegressionStore,
        config: LoopConfig,
    ) -> Self {
        Self {
            detector,
            store,
            alerts,
            regressions,
            config,
            token: CancellationToken::new(),
            liveness: Arc::new(Liveness::default()),
            handles: Vec::new(),
        }
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        Arc::clone(&self.liveness)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the configured number of scanner threads, `start_delay`
    /// apart. Each sweeps forever until the loop is stopped.
    pub fn start(&mut self) {
        let num = self.config.effective_num_scanners();
        let delay = Duration::from_millis(self.config.effective_start_delay_ms());
        for i in 0..num {
            let scanner = Scanner {
                detector: self.detector.clone(),
                store: self.store.clone(),
                alerts: self.alerts.clone(),
                regressions: self.regressions.clone(),
                config: self.config.clone(),
                token: self.token.clone(),
                liveness: Arc::clone(&self.liveness),
            };
            let start_delay = delay * i as u32;
            let handle = std::thread::Builder::new()
                .name(format!("perf-scanner-{i}"))
                .spawn(move || {
                    if sleep_unless_cancelled(&scanner.token, start_delay) {
                        return;
                    }
                    info!(scanner = i, "scanner started");
                    while !scanner.token.is_cancelled() {
                        scanner.sweep();
                    }
                })
                .expect("failed to spawn scanner thread");
            self.handles.push(handle);
        }
    }

    /// Event-driven alternative: consume touched commits from the
    /// file-ingested channel instead of sweeping.
    pub fn start_event_driven(&mut self, commits: Receiver<CommitNumber>) {
        let scanner = Scanner {
            detector: self.detector.clone(),
            store: self.store.clone(),
            alerts: self.alerts.clone(),
            regressions: self.regressions.clone(),
            config: self.config.clone(),
            token: self.token.clone(),
            liveness: Arc::clone(&self.liveness),
        };
        let handle = std::thread::Builder::new()
            .name("perf-scanner-events".to_string())
            .spawn(move || loop {
                if scanner.token.is_cancelled() {
                    return;
                }
                match commits.recv_timeout(Duration::from_millis(200)) {
                    Ok(commit) => scanner.detect_commit(commit),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("failed to spawn event scanner thread");
        self.handles.push(handle);
    }

    /// Cancel and join every scanner.
    pub fn stop(mut self) {
        self.token.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Scanner {
    detector: Detector,
    store: TraceStore,
    alerts: AlertStore,
    regressions: RegressionStore,
    config: LoopConfig,
    token: CancellationToken,
    liveness: Arc<Liveness>,
}

impl Scanner {
    /// One pass over the sliding window: the last `window` commits with
    /// data, skipping the `radius` most recent. Every error is logged and
    /// skipped; only cancellation exits early.
    fn sweep(&self) {
        let radius = self.config.effective_radius().max(0) as usize;
        let window = self.config.effective_window();
        let pacing = Duration::from_millis(self.config.effective_pacing_ms());

        let commits = match self.store.recent_commits_with_data(window + radius) {
            Ok(commits) => commits,
            Err(e) => {
                warn!("sweep could not list commits: {e}");
                sleep_unless_cancelled(&self.token, Duration::from_millis(500));
                return;
            }
        };
        let candidates: Vec<CommitNumber> = commits.into_iter().skip(radius).collect();
        if candidates.is_empty() {
            // Nothing to scan yet; don't spin.
            sleep_unless_cancelled(&self.token, Duration::from_millis(500));
            return;
        }
        for commit in candidates {
            if self.token.is_cancelled() {
                return;
            }
            self.detect_commit(commit);
            if sleep_unless_cancelled(&self.token, pacing) {
                return;
            }
        }

        self.refresh_untriaged();
        self.liveness.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    fn detect_commit(&self, commit: CommitNumber) {
        let alerts = match self.alerts.list_active() {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!("could not list alerts: {e}");
                return;
            }
        };
        let radius = self.config.effective_radius();
        for alert in alerts {
            let started = Instant::now();
            match self.detector.detect_at(&alert, commit, radius, &self.token) {
                Ok(found) => {
                    if !found.is_empty() {
                        self.liveness
                            .regressions_found
                            .fetch_add(found.len() as u64, Ordering::Relaxed);
                    }
                }
                Err(PerfError::Cancelled) => return,
                Err(e) => {
                    warn!(alert = alert.id, commit = commit.0, "detect failed: {e}");
                }
            }
            self.liveness
                .clustering_latency_ms
                .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
    }

    fn refresh_untriaged(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        match self.regressions.untriaged_count_in_window(0, now, None) {
            Ok(count) => self.liveness.untriaged.store(count, Ordering::Relaxed),
            Err(e) => warn!("untriaged count failed: {e}"),
        }
    }
}

/// Sleep in small slices so cancellation stays prompt. Returns true when
/// cancelled.
fn sleep_unless_cancelled(token: &CancellationToken, total: Duration) -> bool {
    let slice = Duration::from_millis(20);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if token.is_cancelled() {
            return true;
        }
        std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
    token.is_cancelled()
}
