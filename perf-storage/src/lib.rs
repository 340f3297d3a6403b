//! # perf-storage
//!
//! SQLite persistence layer for the Perf engine. Read/write connection
//! routing, versioned migrations, and the store types (trace store,
//! commit index, source catalogue, regression store, alert store,
//! shortcut store). All store handles are cheap clones sharing one
//! `DatabaseManager`.

pub mod alerts;
pub mod commits;
pub mod connection;
pub mod migrations;
pub mod regressions;
pub mod shortcuts;
pub mod sources;
pub mod tracestore;

pub use alerts::AlertStore;
pub use commits::CommitStore;
pub use connection::DatabaseManager;
pub use regressions::RegressionStore;
pub use shortcuts::ShortcutStore;
pub use sources::SourceStore;
pub use tracestore::{TraceStore, WriteStats};
