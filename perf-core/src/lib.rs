//! # perf-core
//!
//! Foundation crate for the Perf regression-detection engine.
//! Defines params and structured keys, paramsets, queries, tiles,
//! dataframes, alerts, regression records, errors, config, cancellation,
//! and the external-collaborator traits.
//! Every other crate in the workspace depends on this.

pub mod alert;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod frame;
pub mod params;
pub mod paramset;
pub mod query;
pub mod regression;
pub mod tile;
pub mod traits;

// Re-export the most commonly used types at the crate root.
pub use alert::{Alert, ClusterAlgo, Direction, StepDetection};
pub use cancel::CancellationToken;
pub use errors::{PerfError, PerfErrorCode, Result};
pub use frame::DataFrame;
pub use params::{Params, TraceId};
pub use paramset::{ParamSet, ReadOnlyParamSet};
pub use query::Query;
pub use regression::{ClusterSummary, Regression, StepFit, StepFitStatus, TriageStatus};
pub use tile::{CommitNumber, TileNumber, MISSING_DATA_SENTINEL};
