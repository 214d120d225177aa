//! Beamwidth calibration.
//!
//! Starting from `start_bw`, the beamwidth grows by 10% (at least one) for
//! as long as throughput keeps improving, the 99.9th-percentile latency
//! stays under `15ms + 2 × mean`, and results stay within a recall
//! tolerance of the starting beamwidth's results. Throughput and latency
//! come from what the engine reports per query.

use super::recall::calculate_recall;
use super::{QueryEngine, SearchOutput};
use crate::error::{BuildError, Phase, Result};
use rayon::prelude::*;
use tracing::{debug, info};

/// Beamwidths above this are never tried.
pub const MAX_BEAMWIDTH: u32 = 64;

const TAIL_LATENCY_BASE_US: f64 = 15_000.0;

#[derive(Debug, Clone)]
pub struct TuningConfig {
    pub search_list_size: u32,
    pub start_bw: u32,
    pub threads: usize,
    /// Neighbours requested per query.
    pub recall_at: usize,
    /// Largest accepted recall drop relative to `start_bw`.
    pub recall_tolerance: f64,
}

impl TuningConfig {
    pub fn new(search_list_size: u32, start_bw: u32, threads: usize) -> Self {
        Self {
            search_list_size,
            start_bw,
            threads,
            recall_at: 10,
            recall_tolerance: 0.02,
        }
    }
}

/// Measurements for one beamwidth.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamwidthTrial {
    pub beamwidth: u32,
    pub qps: f64,
    pub mean_latency_us: f64,
    pub p999_latency_us: f64,
    /// Recall against the results at the starting beamwidth.
    pub recall: f64,
    pub mean_ios: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningReport {
    pub best_beamwidth: u32,
    pub trials: Vec<BeamwidthTrial>,
}

/// `ceil(cur × 1.1)`, in integers.
fn next_beamwidth(cur: u32) -> u32 {
    cur.saturating_mul(11).div_ceil(10).max(cur.saturating_add(1))
}

/// Pick the beamwidth with the best throughput for `queries`
/// (`queries.len() / dim` row-major vectors).
pub fn optimize_beamwidth<E: QueryEngine + ?Sized>(
    engine: &E,
    queries: &[f32],
    dim: usize,
    config: &TuningConfig,
) -> Result<TuningReport> {
    if dim == 0 || queries.is_empty() || queries.len() % dim != 0 {
        return Err(BuildError::config(
            Phase::Tune,
            format!("{} query values do not form rows of dim {dim}", queries.len()),
        ));
    }
    if config.start_bw == 0 || config.start_bw > MAX_BEAMWIDTH {
        return Err(BuildError::config(
            Phase::Tune,
            format!("start_bw must be in 1..={MAX_BEAMWIDTH}, got {}", config.start_bw),
        ));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()
        .map_err(|e| BuildError::config(Phase::Tune, e.to_string()))?;
    let k = config.recall_at.min(config.search_list_size as usize).max(1);
    let num_queries = queries.len() / dim;

    let mut baseline: Option<Vec<Vec<u32>>> = None;
    let mut trials = Vec::new();
    let mut best = config.start_bw;
    let mut max_qps = 0.0f64;
    let mut cur = config.start_bw;

    loop {
        let outputs: Vec<SearchOutput> = pool.install(|| {
            queries
                .par_chunks(dim)
                .map(|q| engine.search(q, k, config.search_list_size, cur))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut latencies: Vec<f64> = outputs.iter().map(|o| o.stats.latency_us).collect();
        latencies.sort_by(f64::total_cmp);
        let total_us: f64 = latencies.iter().sum();
        let mean = total_us / num_queries as f64;
        let p999 = latencies[((0.999 * num_queries as f64) as usize).min(num_queries - 1)];
        let qps = if total_us > 0.0 {
            config.threads.max(1) as f64 * num_queries as f64 / (total_us / 1e6)
        } else {
            f64::INFINITY
        };
        let mean_ios =
            outputs.iter().map(|o| o.stats.n_ios as f64).sum::<f64>() / num_queries as f64;

        let ids: Vec<Vec<u32>> = outputs.into_iter().map(|o| o.ids).collect();
        let recall = match &baseline {
            None => 1.0,
            Some(base) => calculate_recall(base, None, &ids, k),
        };
        if baseline.is_none() {
            baseline = Some(ids);
        }

        debug!(beamwidth = cur, qps, mean, p999, recall, "beamwidth trial");
        trials.push(BeamwidthTrial {
            beamwidth: cur,
            qps,
            mean_latency_us: mean,
            p999_latency_us: p999,
            recall,
            mean_ios,
        });

        let accepted = qps > max_qps
            && p999 < TAIL_LATENCY_BASE_US + 2.0 * mean
            && recall >= 1.0 - config.recall_tolerance;
        if !accepted {
            break;
        }
        max_qps = qps;
        best = cur;
        cur = next_beamwidth(cur);
        if cur > MAX_BEAMWIDTH {
            break;
        }
    }

    info!(best_beamwidth = best, trials = trials.len(), "beamwidth tuned");
    Ok(TuningReport {
        best_beamwidth: best,
        trials,
    })
}
