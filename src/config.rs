//! Build configuration and tuning constants.
//!
//! Tuning constants live as named defaults on [`Tunables`], passed explicitly
//! into every component that needs them so tests can shrink them per run.

use crate::distance::DistanceMetric;
use crate::error::{BuildError, IoContext, Phase, Result};
use crate::tune::MAX_BEAMWIDTH;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound on the PQ training sample.
pub const MAX_PQ_TRAINING_SET_SIZE: usize = 256_000;
/// Upper bound on vectors read from a warmup file.
pub const MAX_SAMPLE_POINTS_FOR_WARMUP: usize = 100_000;
/// Fraction of the dataset drawn for PQ training.
pub const PQ_TRAINING_SET_FRACTION: f64 = 0.1;
/// Serving RAM reserved for the hot-node cache.
pub const SPACE_FOR_CACHED_NODES_IN_GB: f64 = 0.25;
/// Serving budgets below this leave no room for a node cache.
pub const THRESHOLD_FOR_CACHING_IN_GB: f64 = 1.0;
/// Nodes kept in the query engine's cache.
pub const NUM_NODES_TO_CACHE: usize = 250_000;
/// Search list size used for warmup queries.
pub const WARMUP_L: u32 = 20;
/// k-means restarts per PQ chunk.
pub const NUM_KMEANS_REPS: usize = 12;
/// Centroids per PQ chunk (codes are one byte).
pub const NUM_PQ_CENTROIDS: usize = 256;
/// Upper bound on PQ chunks regardless of budget.
pub const MAX_PQ_CHUNKS: usize = 512;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Tuning constants, overridable per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub max_pq_training_set_size: usize,
    pub pq_training_set_fraction: f64,
    pub num_kmeans_reps: usize,
    /// Lloyd iterations inside one k-means restart.
    pub kmeans_iterations: usize,
    pub num_pq_centroids: usize,
    pub max_pq_chunks: usize,
    pub max_sample_points_for_warmup: usize,
    pub num_nodes_to_cache: usize,
    pub warmup_l: u32,
    pub space_for_cached_nodes_in_gb: f64,
    pub threshold_for_caching_in_gb: f64,
    /// Points per block when streaming the base file.
    pub block_size: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_pq_training_set_size: MAX_PQ_TRAINING_SET_SIZE,
            pq_training_set_fraction: PQ_TRAINING_SET_FRACTION,
            num_kmeans_reps: NUM_KMEANS_REPS,
            kmeans_iterations: 15,
            num_pq_centroids: NUM_PQ_CENTROIDS,
            max_pq_chunks: MAX_PQ_CHUNKS,
            max_sample_points_for_warmup: MAX_SAMPLE_POINTS_FOR_WARMUP,
            num_nodes_to_cache: NUM_NODES_TO_CACHE,
            warmup_l: WARMUP_L,
            space_for_cached_nodes_in_gb: SPACE_FOR_CACHED_NODES_IN_GB,
            threshold_for_caching_in_gb: THRESHOLD_FOR_CACHING_IN_GB,
            block_size: 100_000,
        }
    }
}

impl Tunables {
    /// Small constants for unit tests and toy datasets.
    pub fn small() -> Self {
        Self {
            max_pq_training_set_size: 2_000,
            num_kmeans_reps: 2,
            kmeans_iterations: 8,
            num_pq_centroids: 16,
            max_sample_points_for_warmup: 1_000,
            num_nodes_to_cache: 1_000,
            block_size: 64,
            ..Self::default()
        }
    }

    /// Vectors the warmup loader will read at most.
    pub fn warmup_limit(&self) -> usize {
        self.max_sample_points_for_warmup
            .min(self.num_nodes_to_cache)
    }
}

/// Parameters of one disk index build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskBuildParams {
    pub metric: DistanceMetric,
    /// Search list size for shard construction and tuning (L).
    pub search_list_size: u32,
    /// Maximum out-degree (R).
    pub max_degree: u32,
    /// Fraction of points sampled for partitioning; derived from the dataset
    /// size when unset.
    pub sampling_rate: Option<f64>,
    /// RAM available while building one shard graph.
    pub build_ram_budget_gb: f64,
    /// RAM the finished index may use while serving (sizes PQ).
    pub search_ram_budget_gb: f64,
    /// PQ bytes per vector stored inside sectors; 0 stores full vectors.
    pub disk_pq_chunks: usize,
    pub use_sector_reordering: bool,
    /// Write full-precision vectors to a separate re-rank file.
    pub rerank_disk_pq: bool,
    pub threads: usize,
    /// Reorder window; defaults to the number of records per sector.
    pub omega: Option<usize>,
    pub start_bw: u32,
    pub sector_size: usize,
    /// Nearest shards each point is replicated to.
    pub k_base: usize,
    pub seed: u64,
    #[serde(skip)]
    pub tunables: Tunables,
}

impl Default for DiskBuildParams {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::L2,
            search_list_size: 100,
            max_degree: 64,
            sampling_rate: None,
            build_ram_budget_gb: 8.0,
            search_ram_budget_gb: 1.0,
            disk_pq_chunks: 0,
            use_sector_reordering: false,
            rerank_disk_pq: false,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            omega: None,
            start_bw: 2,
            sector_size: 4096,
            k_base: 2,
            seed: 42,
            tunables: Tunables::default(),
        }
    }
}

impl DiskBuildParams {
    /// Load parameters from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).at(Phase::Config, path)?;
        let params: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| BuildError::corrupt(Phase::Config, path, e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Reject inconsistent parameters before anything touches disk.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(BuildError::config(Phase::Config, reason));

        if self.max_degree == 0 {
            return fail("max_degree (R) must be at least 1".into());
        }
        if self.search_list_size == 0 {
            return fail("search_list_size (L) must be at least 1".into());
        }
        if !(self.build_ram_budget_gb > 0.0) {
            return fail(format!(
                "build_ram_budget_gb must be positive, got {}",
                self.build_ram_budget_gb
            ));
        }
        if !(self.search_ram_budget_gb > 0.0) {
            return fail(format!(
                "search_ram_budget_gb must be positive, got {}",
                self.search_ram_budget_gb
            ));
        }
        if let Some(rate) = self.sampling_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return fail(format!("sampling_rate must be in (0, 1], got {rate}"));
            }
        }
        if self.sector_size < 512 || self.sector_size % 512 != 0 {
            return fail(format!(
                "sector_size must be a positive multiple of 512, got {}",
                self.sector_size
            ));
        }
        if self.rerank_disk_pq && self.disk_pq_chunks == 0 {
            return fail("rerank_disk_pq requires disk_pq_chunks > 0".into());
        }
        if self.threads == 0 {
            return fail("threads must be at least 1".into());
        }
        if self.omega == Some(0) {
            return fail("omega must be at least 1".into());
        }
        if self.start_bw == 0 || self.start_bw > MAX_BEAMWIDTH {
            return fail(format!(
                "start_bw must be in 1..={MAX_BEAMWIDTH}, got {}",
                self.start_bw
            ));
        }
        if self.k_base == 0 {
            return fail("k_base must be at least 1".into());
        }
        Ok(())
    }
}

/// Bytes of serving RAM available for compressed vectors.
///
/// When the budget clears the caching threshold, the cached-node reservation
/// is subtracted first.
pub fn get_memory_budget(search_ram_budget_gb: f64, tunables: &Tunables) -> Result<f64> {
    if !(search_ram_budget_gb > 0.0) {
        return Err(BuildError::config(
            Phase::Config,
            format!("search RAM budget must be positive, got {search_ram_budget_gb} GB"),
        ));
    }
    let mut limit = search_ram_budget_gb;
    if search_ram_budget_gb - tunables.space_for_cached_nodes_in_gb
        > tunables.threshold_for_caching_in_gb
    {
        limit = search_ram_budget_gb - tunables.space_for_cached_nodes_in_gb;
    }
    Ok(limit * GIB)
}

/// [`get_memory_budget`] from a textual GB value.
pub fn parse_memory_budget(budget: &str, tunables: &Tunables) -> Result<f64> {
    let gb: f64 = budget.trim().parse().map_err(|_| {
        BuildError::config(Phase::Config, format!("not a memory budget: {budget:?}"))
    })?;
    get_memory_budget(gb, tunables)
}
