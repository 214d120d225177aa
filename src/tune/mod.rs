//! Build-time calibration against the finished layout.
//!
//! The query engine itself lives outside this crate; the tuner and the
//! warmup loader only need the [`QueryEngine`] capability. A small
//! [`SectorSearchEngine`] over [`crate::layout::DiskIndexReader`] is
//! provided for end-to-end checks.

mod beamwidth;
mod engine;
mod recall;
mod warmup;

pub use beamwidth::{
    optimize_beamwidth, BeamwidthTrial, TuningConfig, TuningReport, MAX_BEAMWIDTH,
};
pub use engine::SectorSearchEngine;
pub use recall::{calculate_range_search_recall, calculate_recall, calculate_recall_with_active_tags};
pub use warmup::{load_warmup, warm_up, warmup_aligned_dim, WarmupSet};

use crate::error::Result;

/// Per-query measurements reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryStats {
    pub latency_us: f64,
    /// Sectors read.
    pub n_ios: u32,
    /// Expansion rounds.
    pub n_hops: u32,
}

/// Nearest neighbours of one query, closest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutput {
    pub ids: Vec<u32>,
    pub distances: Vec<f32>,
    pub stats: QueryStats,
}

/// A search engine serving a finished disk index.
pub trait QueryEngine: Sync {
    /// `k` nearest neighbours of `query`, using a candidate list of
    /// `search_list_size` and `beamwidth` sector reads per round.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        search_list_size: u32,
        beamwidth: u32,
    ) -> Result<SearchOutput>;
}
