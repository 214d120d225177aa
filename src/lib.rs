//! shardann: out-of-core build pipeline for disk-resident ANN graph indexes.
//!
//! Builds a Vamana-style proximity graph over a dataset that does not fit in
//! memory and packs it into fixed-size disk sectors, so that a beam-search
//! engine can traverse it with bounded, sector-aligned reads.
//!
//! Pipeline, leaves first:
//!
//! - [`quantization`]: product quantization sized to the *serving* RAM budget
//! - [`partitioning`]: k-means shard partitioning sized to the *build* RAM budget
//! - [`shard`]: per-shard graph construction behind [`shard::ShardGraphBuilder`]
//! - [`merge`]: union of shard graphs under a global degree bound
//! - [`layout`]: sector-packed index file
//! - [`reorder`]: locality-aware node permutation (optional)
//! - [`tune`]: beamwidth calibration, recall, and cache warmup
//!
//! [`pipeline::build_disk_index`] drives the whole sequence.
//!
//! # Sector invariant
//!
//! Every node record (`id | payload | degree | R neighbour slots`) must fit in
//! one sector. A layout either writes every node or fails before the first
//! data sector; neighbour lists are never truncated to make a record fit.
//!
//! # References
//!
//! - Jayaram Subramanya et al. (2019): "DiskANN: Fast Accurate Billion-point
//!   Nearest Neighbor Search on a Single Node"
//! - Wei, Yu, Lu, Lin (2016): "Speedup Graph Processing by Graph Ordering" (Gorder)

pub mod config;
pub mod distance;
pub mod error;
pub mod io;
pub mod layout;
pub mod merge;
pub mod partitioning;
pub mod pipeline;
pub mod quantization;
pub mod reorder;
pub mod shard;
pub mod tune;

// Re-exports
pub use config::{DiskBuildParams, Tunables};
pub use distance::DistanceMetric;
pub use error::{BuildError, Phase, Result};
