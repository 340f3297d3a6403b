//! The async request registry: long-running user requests (dataframe
//! builds, ad-hoc regression detection) tracked as processes with
//! poll-and-expire semantics.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_128;

use perf_core::cancel::CancellationToken;
use perf_core::errors::{PerfError, Result};

/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Success,
    Error,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

struct Process {
    state: ProcessState,
    message: String,
    result: Option<serde_json::Value>,
    token: CancellationToken,
    last_update: Instant,
}

struct Inner {
    processes: Mutex<FxHashMap<String, Process>>,
    retention: Duration,
}

/// Handle given to a running request for reporting progress.
#[derive(Clone)]
pub struct Progress {
    id: String,
    inner: Arc<Inner>,
}

impl Progress {
    /// Update the user-readable progress string ("34% complete", …).
    pub fn message(&self, message: impl Into<String>) {
        if let Ok(mut procs) = self.inner.processes.lock() {
            if let Some(p) = procs.get_mut(&self.id) {
                if p.state == ProcessState::Running {
                    p.message = message.into();
                    p.last_update = Instant::now();
                }
            }
        }
    }
}

/// Registry of in-flight and recently finished processes.
///
/// Identical requests dedupe onto the same process while it is running.
/// Finished processes linger for `retention` after their last update,
/// then a background sweeper collects them.
#[derive(Clone)]
pub struct RequestRegistry {
    inner: Arc<Inner>,
}

const DEFAULT_RETENTION: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        let inner = Arc::new(Inner {
            processes: Mutex::new(FxHashMap::default()),
            retention,
        });
        spawn_sweeper(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Deterministic id for a request: digest of its canonical JSON form.
    pub fn id_for<R: Serialize>(request: &R) -> Result<String> {
        let canonical = serde_json::to_string(request)
            .map_err(|e| PerfError::invalid_input(format!("request does not serialize: {e}")))?;
        Ok(format!("{:032x}", xxh3_128(canonical.as_bytes())))
    }

    /// Start a process for the request, or reuse the running process with
    /// the same id. The closure runs on its own thread; its `Ok` value
    /// becomes the response, `Err` (including `Cancelled`) the error
    /// message.
    pub fn add<R, F>(&self, request: &R, work: F) -> Result<String>
    where
        R: Serialize,
        F: FnOnce(&Progress, &CancellationToken) -> Result<serde_json::Value> + Send + 'static,
    {
        let id = Self::id_for(request)?;
        let token = CancellationToken::new();
        {
            let mut procs = self
                .inner
                .processes
                .lock()
                .map_err(|_| PerfError::fatal("registry lock poisoned"))?;
            if let Some(existing) = procs.get(&id) {
                if existing.state == ProcessState::Running {
                    return Ok(id); // dedupe onto the in-flight process
                }
            }
            procs.insert(
                id.clone(),
                Process {
                    state: ProcessState::Running,
                    message: "Starting".to_string(),
                    result: None,
                    token: token.clone(),
                    last_update: Instant::now(),
                },
            );
        }

        let progress = Progress { id: id.clone(), inner: Arc::clone(&self.inner) };
        let inner = Arc::clone(&self.inner);
        let thread_id = id.clone();
        std::thread::Builder::new()
            .name("perf-request".to_string())
            .spawn(move || {
                let outcome = work(&progress, &token);
                let Ok(mut procs) = inner.processes.lock() else { return };
                let Some(p) = procs.get_mut(&thread_id) else { return };
                match outcome {
                    Ok(value) => {
                        p.state = ProcessState::Success;
                        p.message = "Finished".to_string();
                        p.result = Some(value);
                    }
                    Err(e) => {
                        p.state = ProcessState::Error;
                        p.message = e.to_string();
                    }
                }
                p.last_update = Instant::now();
            })
            .map_err(|e| PerfError::fatal(format!("spawn request thread: {e}")))?;
        Ok(id)
    }

    /// Current state and progress message.
    pub fn status(&self, id: &str) -> Result<(ProcessState, String)> {
        let procs = self
            .inner
            .processes
            .lock()
            .map_err(|_| PerfError::fatal("registry lock poisoned"))?;
        procs
            .get(id)
            .map(|p| (p.state, p.message.clone()))
            .ok_or_else(|| PerfError::not_found(format!("no process {id}")))
    }

    /// The response value; only valid once the process succeeded.
    pub fn response(&self, id: &str) -> Result<serde_json::Value> {
        let procs = self
            .inner
            .processes
            .lock()
            .map_err(|_| PerfError::fatal("registry lock poisoned"))?;
        let p = procs
            .get(id)
            .ok_or_else(|| PerfError::not_found(format!("no process {id}")))?;
        match p.state {
            ProcessState::Success => p
                .result
                .clone()
                .ok_or_else(|| PerfError::fatal("successful process has no result")),
            ProcessState::Running => Err(PerfError::invalid_input("process still running")),
            ProcessState::Error => Err(PerfError::invalid_input(format!(
                "process failed: {}",
                p.message
            ))),
        }
    }

    /// Cancel a running process; it transitions to `Error` once the work
    /// observes the token.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let procs = self
            .inner
            .processes
            .lock()
            .map_err(|_| PerfError::fatal("registry lock poisoned"))?;
        let p = procs
            .get(id)
            .ok_or_else(|| PerfError::not_found(format!("no process {id}")))?;
        p.token.cancel();
        Ok(())
    }

    /// Drop terminal processes whose last update is older than the
    /// retention window. The background sweeper calls this periodically;
    /// exposed for tests.
    pub fn sweep_now(&self) {
        sweep(&self.inner);
    }
}

fn sweep(inner: &Inner) {
    let Ok(mut procs) = inner.processes.lock() else {
        warn!("registry lock poisoned during sweep");
        return;
    };
    let retention = inner.retention;
    procs.retain(|_, p| !(p.state.is_terminal() && p.last_update.elapsed() > retention));
}

fn spawn_sweeper(inner: Weak<Inner>) {
    std::thread::Builder::new()
        .name("perf-request-sweeper".to_string())
        .spawn(move || loop {
            std::thread::sleep(SWEEP_INTERVAL);
            match inner.upgrade() {
                Some(inner) => sweep(&inner),
                None => return, // registry dropped
            }
        })
        .expect("failed to spawn registry sweeper thread");
}
