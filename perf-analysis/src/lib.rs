//! # perf-analysis
//!
//! The detection side of the Perf engine: dataframe building, k-means
//! clustering, step fitting, the regression detector, the continuous
//! scanning loop, and the async request registry.

pub mod continuous;
pub mod dataframe;
pub mod detector;
pub mod kmeans;
pub mod registry;
pub mod stepfit;
pub mod vecops;

pub use continuous::{ContinuousLoop, Liveness};
pub use dataframe::DataFrameBuilder;
pub use detector::Detector;
pub use registry::{ProcessState, Progress, RequestRegistry};
