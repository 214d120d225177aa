//! Dataset partitioning for out-of-core graph construction.
//!
//! The base file is split into shards small enough that one shard's graph
//! build fits the build RAM budget. Points are replicated into their
//! `k_base` nearest shards so that the merged graph keeps edges across shard
//! boundaries.

pub mod kmeans;
mod shards;

pub use kmeans::{best_of_restarts, KMeans};
pub use shards::{
    estimate_ram_usage, gen_random_slice, partition_with_ram_budget, shard_data_into_clusters,
    write_random_slice, PartitionSummary,
};
