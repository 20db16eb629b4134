//! Subcompartment clustering
//!
//! `distance` holds the NaN-aware metrics, `kmeans` a single seeded
//! k-means/k-medians run on the worker pool and `engine` the sweep over
//! cluster counts with retries, scoring and model selection.

pub mod distance;
pub mod engine;
pub mod kmeans;

pub use distance::Metric;
pub use engine::{ClusteringEngine, KResult, SweepResult};
pub use kmeans::{ClusterRun, KMeans, Points};
