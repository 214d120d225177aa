//! Per-shard graph construction.
//!
//! The graph algorithm that runs inside a shard is pluggable: anything that
//! reads a shard's vectors and writes a graph file over local ids (with the
//! shard medoid recorded as the header's start node) can drive the build.
//! [`ExhaustiveKnnBuilder`] is a reference implementation for small shards
//! and tests; production builds plug in a Vamana builder.

use crate::config::DiskBuildParams;
use crate::distance::DistanceMetric;
use crate::error::{BuildError, Phase, Result};
use crate::io::{read_bin, read_bin_header, write_bin, GraphWriter, IndexPaths};
use crate::merge::{merge_shards_within, DistanceRanker, MergeOutcome, ShardInput};
use crate::partitioning::{estimate_ram_usage, partition_with_ram_budget};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Points sampled for partitioning when no rate is configured.
const PARTITION_SAMPLE_POINTS: f64 = 150_000.0;

/// Parameters handed to a shard builder.
#[derive(Debug, Clone, Copy)]
pub struct ShardBuildParams {
    pub metric: DistanceMetric,
    pub max_degree: u32,
    pub search_list_size: u32,
    /// Occlusion factor for neighbour pruning.
    pub alpha: f32,
}

impl ShardBuildParams {
    pub fn from_build(params: &DiskBuildParams) -> Self {
        Self {
            metric: params.metric,
            max_degree: params.max_degree,
            search_list_size: params.search_list_size,
            alpha: 1.2,
        }
    }
}

/// Builds one shard's graph.
///
/// Implementations read `data` (a bin file of `f32` vectors) and write a
/// graph file over local ids `[0, npts)` to `graph_out`, with every degree
/// at most `params.max_degree` and the header start set to the shard medoid.
pub trait ShardGraphBuilder: Send + Sync {
    fn build_shard(&self, data: &Path, graph_out: &Path, params: &ShardBuildParams) -> Result<()>;
}

/// Exact k-NN candidates followed by alpha pruning.
///
/// Quadratic in the shard size.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExhaustiveKnnBuilder;

impl ExhaustiveKnnBuilder {
    fn neighbors(
        data: &[f32],
        dim: usize,
        node: usize,
        params: &ShardBuildParams,
    ) -> Vec<u32> {
        let n = data.len() / dim;
        let v = &data[node * dim..(node + 1) * dim];
        let mut candidates: Vec<(f32, u32)> = (0..n)
            .filter(|&j| j != node)
            .map(|j| (params.metric.distance(v, &data[j * dim..(j + 1) * dim]), j as u32))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.truncate((params.search_list_size.max(params.max_degree)) as usize);

        let max_degree = params.max_degree as usize;
        let mut kept: Vec<u32> = Vec::with_capacity(max_degree);
        for &(d, c) in &candidates {
            if kept.len() >= max_degree {
                break;
            }
            let cv = &data[c as usize * dim..(c as usize + 1) * dim];
            let occluded = kept.iter().any(|&k| {
                let kv = &data[k as usize * dim..(k as usize + 1) * dim];
                params.alpha * params.metric.distance(cv, kv) < d
            });
            if !occluded {
                kept.push(c);
            }
        }
        // Backfill with the nearest pruned candidates so small shards stay
        // well connected.
        for &(_, c) in &candidates {
            if kept.len() >= max_degree {
                break;
            }
            if !kept.contains(&c) {
                kept.push(c);
            }
        }
        kept
    }
}

impl ShardGraphBuilder for ExhaustiveKnnBuilder {
    fn build_shard(&self, data: &Path, graph_out: &Path, params: &ShardBuildParams) -> Result<()> {
        let (vectors, header) = read_bin::<f32>(data, Phase::ShardBuild)?;
        let (n, dim) = (header.npts, header.dim);
        if dim == 0 && n > 0 {
            return Err(BuildError::corrupt(Phase::ShardBuild, data, "zero dimension"));
        }

        let adjacency: Vec<Vec<u32>> = (0..n)
            .into_par_iter()
            .map(|i| Self::neighbors(&vectors, dim, i, params))
            .collect();

        let mut mean = vec![0.0f64; dim];
        for row in vectors.chunks_exact(dim.max(1)) {
            for (m, &x) in mean.iter_mut().zip(row) {
                *m += x as f64;
            }
        }
        let mean: Vec<f32> = mean.iter().map(|&s| (s / n.max(1) as f64) as f32).collect();
        let medoid = (0..n)
            .map(|i| {
                let d = crate::distance::l2_squared(&vectors[i * dim..(i + 1) * dim], &mean);
                (d, i)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map_or(0, |(_, i)| i as u32);

        let mut writer = GraphWriter::create(graph_out, Phase::ShardBuild, params.max_degree, medoid)?;
        for neighbors in &adjacency {
            writer.write_node(neighbors)?;
        }
        writer.finish()?;
        Ok(())
    }
}

/// Result of building the merged graph.
#[derive(Debug, Clone)]
pub struct MergedGraph {
    pub num_nodes: usize,
    pub dim: usize,
    pub num_shards: usize,
    pub medoids: Vec<u32>,
    /// Shard id maps, kept for locality reordering. Empty for a single-shard
    /// build.
    pub shard_idmaps: Vec<PathBuf>,
}

/// Build the global graph for `base` into `paths.merged_graph()`.
///
/// When the whole dataset fits `build_ram_budget_gb` it is built as a single
/// shard; otherwise it is partitioned, each shard is built in turn, and the
/// shard graphs are merged. Shard data and graph files are removed once
/// merged; the id maps are left for the caller.
pub fn build_merged_vamana_index(
    base: &Path,
    paths: &IndexPaths,
    params: &DiskBuildParams,
    builder: &dyn ShardGraphBuilder,
) -> Result<MergedGraph> {
    let header = read_bin_header::<f32>(base, Phase::ShardBuild)?;
    let shard_params = ShardBuildParams::from_build(params);
    let full_ram = estimate_ram_usage(
        header.npts as u64,
        header.dim,
        std::mem::size_of::<f32>(),
        params.max_degree as usize,
    );

    if full_ram <= params.build_ram_budget_gb * GIB {
        info!(
            npts = header.npts,
            est_ram_gb = full_ram / GIB,
            "dataset fits build budget, building a single graph"
        );
        builder.build_shard(base, &paths.merged_graph(), &shard_params)?;
        let (graph_header, _) =
            crate::io::load_graph(&paths.merged_graph(), Phase::ShardBuild, Some(header.npts))?;
        let medoids = vec![graph_header.start];
        write_bin(&paths.medoids(), Phase::ShardBuild, &medoids, 1, 1)?;
        return Ok(MergedGraph {
            num_nodes: header.npts,
            dim: header.dim,
            num_shards: 1,
            medoids,
            shard_idmaps: Vec::new(),
        });
    }

    let sampling_rate = params
        .sampling_rate
        .unwrap_or_else(|| (PARTITION_SAMPLE_POINTS / header.npts.max(1) as f64).min(1.0));
    let summary = partition_with_ram_budget(
        base,
        sampling_rate,
        params.build_ram_budget_gb,
        params.max_degree as usize,
        paths,
        params.k_base,
        &params.tunables,
        params.seed,
    )?;

    let mut shards = Vec::with_capacity(summary.num_shards);
    for (shard, &size) in summary.shard_sizes.iter().enumerate() {
        if size == 0 {
            warn!(shard, "shard received no points");
        }
        builder
            .build_shard(&paths.shard_data(shard), &paths.shard_graph(shard), &shard_params)
            .map_err(|e| match e {
                BuildError::Config { reason, .. } => BuildError::config(
                    Phase::ShardBuild,
                    format!("shard {shard}: {reason}"),
                ),
                other => other,
            })?;
        info!(shard, size, "built shard graph");
        shards.push(ShardInput {
            graph: paths.shard_graph(shard),
            idmap: paths.shard_idmap(shard),
        });
    }

    let ranker = DistanceRanker::open(base, params.metric)?;
    let MergeOutcome {
        num_nodes, medoids, ..
    } = merge_shards_within(
        &shards,
        &paths.merged_graph(),
        &paths.medoids(),
        params.max_degree,
        &ranker,
        params.threads,
        (params.build_ram_budget_gb * GIB) as u64,
    )?;

    for shard in 0..summary.num_shards {
        for path in [paths.shard_data(shard), paths.shard_graph(shard)] {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove shard file");
            }
        }
    }

    Ok(MergedGraph {
        num_nodes,
        dim: header.dim,
        num_shards: summary.num_shards,
        medoids,
        shard_idmaps: shards.into_iter().map(|s| s.idmap).collect(),
    })
}
