//! Cache warmup from a sample file.

use super::QueryEngine;
use crate::config::Tunables;
use crate::error::{BuildError, Phase, Result};
use crate::io::BinReader;
use rayon::prelude::*;
use std::path::Path;
use tracing::{info, warn};

/// Row stride of warmup buffers: `dim` rounded up to 8 floats (32 bytes).
pub fn warmup_aligned_dim(dim: usize) -> usize {
    dim.div_ceil(8) * 8
}

/// Warmup queries, one zero-padded row of `aligned_dim` floats each.
#[derive(Debug, Clone)]
pub struct WarmupSet {
    data: Vec<f32>,
    num_points: usize,
    dim: usize,
    aligned_dim: usize,
}

impl WarmupSet {
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn aligned_dim(&self) -> usize {
        self.aligned_dim
    }

    /// Query `i` without its padding.
    pub fn query(&self, i: usize) -> &[f32] {
        let start = i * self.aligned_dim;
        &self.data[start..start + self.dim]
    }

    /// Row `i` including padding.
    pub fn padded_row(&self, i: usize) -> &[f32] {
        let start = i * self.aligned_dim;
        &self.data[start..start + self.aligned_dim]
    }
}

/// Load at most [`Tunables::warmup_limit`] vectors from `path`.
///
/// A missing file is not an error: the engine simply starts cold.
/// A file whose dimension differs from `expected_dim` is.
pub fn load_warmup(path: &Path, expected_dim: usize, tunables: &Tunables) -> Result<Option<WarmupSet>> {
    if !path.exists() {
        warn!(path = %path.display(), "warmup file not found, starting cold");
        return Ok(None);
    }
    let mut reader = BinReader::<f32>::open(path, Phase::Warmup)?;
    let header = reader.header();
    if header.dim != expected_dim {
        return Err(BuildError::DimensionMismatch {
            phase: Phase::Warmup,
            path: path.to_path_buf(),
            expected: expected_dim,
            actual: header.dim,
        });
    }

    let num_points = header.npts.min(tunables.warmup_limit());
    let aligned_dim = warmup_aligned_dim(expected_dim);
    let rows = reader.read_block(num_points)?;
    let mut data = vec![0.0f32; num_points * aligned_dim];
    for (dst, src) in data
        .chunks_exact_mut(aligned_dim)
        .zip(rows.chunks_exact(expected_dim.max(1)))
    {
        dst[..expected_dim].copy_from_slice(src);
    }

    info!(num_points, aligned_dim, "loaded warmup set");
    Ok(Some(WarmupSet {
        data,
        num_points,
        dim: expected_dim,
        aligned_dim,
    }))
}

/// Run one search per warmup vector with `warmup_l`; returns the number of
/// searches issued.
pub fn warm_up<E: QueryEngine + ?Sized>(
    engine: &E,
    set: &WarmupSet,
    beamwidth: u32,
    tunables: &Tunables,
    threads: usize,
) -> Result<usize> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| BuildError::config(Phase::Warmup, e.to_string()))?;
    pool.install(|| {
        (0..set.num_points())
            .into_par_iter()
            .try_for_each(|i| engine.search(set.query(i), 1, tunables.warmup_l, beamwidth).map(drop))
    })?;
    info!(searches = set.num_points(), warmup_l = tunables.warmup_l, "warmup done");
    Ok(set.num_points())
}
