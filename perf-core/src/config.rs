//! Instance configuration.

use serde::{Deserialize, Serialize};

use crate::errors::{PerfError, Result};

/// Configuration for the trace store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Commits per tile. Default: 256.
    pub tile_size: Option<i32>,
    /// Hard budget for one write batch, in seconds. Default: 900 (15 min).
    pub write_budget_secs: Option<u64>,
}

impl StoreConfig {
    pub fn effective_tile_size(&self) -> i32 {
        self.tile_size.unwrap_or(256)
    }

    pub fn effective_write_budget_secs(&self) -> u64 {
        self.write_budget_secs.unwrap_or(900)
    }
}

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IngestConfig {
    /// URI prefixes to accept; events outside are acked without processing.
    /// Empty means accept everything.
    pub accepted_prefixes: Vec<String>,
    /// Branch allow-list; files carrying another `branch` param are skipped.
    /// Empty means accept all branches.
    pub branches: Vec<String>,
    /// Concurrent file handlers. Default: 10.
    pub workers: Option<usize>,
    /// Bound on the delivery channel. Default: 1000.
    pub channel_bound: Option<usize>,
}

impl IngestConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or(10)
    }

    pub fn effective_channel_bound(&self) -> usize {
        self.channel_bound.unwrap_or(1000)
    }
}

/// Configuration for the continuous regression-detection loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoopConfig {
    /// Parallel scanners. Default: 3.
    pub num_scanners: Option<usize>,
    /// Commits on each side of a candidate. Default: 10.
    pub radius: Option<i32>,
    /// Sliding window of commits each sweep covers. Default: 100.
    pub window: Option<usize>,
    /// Delay between scanner starts, in milliseconds. Default: 2000.
    pub start_delay_ms: Option<u64>,
    /// Pacing sleep between candidate commits, in milliseconds. Default: 100.
    pub pacing_ms: Option<u64>,
}

impl LoopConfig {
    pub fn effective_num_scanners(&self) -> usize {
        self.num_scanners.unwrap_or(3)
    }

    pub fn effective_radius(&self) -> i32 {
        self.radius.unwrap_or(10)
    }

    pub fn effective_window(&self) -> usize {
        self.window.unwrap_or(100)
    }

    pub fn effective_start_delay_ms(&self) -> u64 {
        self.start_delay_ms.unwrap_or(2000)
    }

    pub fn effective_pacing_ms(&self) -> u64 {
        self.pacing_ms.unwrap_or(100)
    }
}

/// Top-level instance configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InstanceConfig {
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub scanning: LoopConfig,
}

impl InstanceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| PerfError::invalid_input(format!("instance config: {e}")))
    }
}
