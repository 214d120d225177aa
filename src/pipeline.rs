//! End-to-end disk index build.
//!
//! ```text
//! base ─► preprocess ─► PQ (serving budget) ─► merged graph ─► [reorder] ─► layout ─► tuning sample
//! ```
//!
//! Each phase publishes its outputs only when it completes; a failure leaves
//! the earlier phases' files in place and nothing half-written from the
//! failing one.

use crate::config::{get_memory_budget, DiskBuildParams};
use crate::distance::{normalize_in_place, DistanceMetric};
use crate::error::{BuildError, IoContext, Phase, Result};
use crate::io::{read_bin_header, BinReader, BinWriter, IndexPaths, Staged};
use crate::layout::{create_disk_layout, LayoutHeader, LayoutSpec};
use crate::partitioning::write_random_slice;
use crate::quantization::{calculate_num_pq_chunks, generate_pq};
use crate::reorder::{disjoint_parts_from_idmaps, reorder_merged_shards, Permutation};
use crate::shard::{build_merged_vamana_index, ExhaustiveKnnBuilder, MergedGraph, ShardGraphBuilder};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Points drawn for the tuning and warmup sample.
const TUNING_SAMPLE_POINTS: f64 = 150_000.0;

/// Normalize the base file for cosine builds.
///
/// For [`DistanceMetric::Cosine`] an L2-normalised copy is written to
/// `paths.normalized_base()` and the build continues under L2. Other metrics
/// use `infile` unchanged.
pub fn preprocess_base_file(
    infile: &Path,
    paths: &IndexPaths,
    metric: DistanceMetric,
    block_size: usize,
) -> Result<(PathBuf, DistanceMetric)> {
    if metric != DistanceMetric::Cosine {
        return Ok((infile.to_path_buf(), metric));
    }
    let out = paths.normalized_base();
    let mut reader = BinReader::<f32>::open(infile, Phase::Config)?;
    let dim = reader.header().dim;
    let mut writer = BinWriter::<f32>::create(&out, Phase::Config, dim)?;
    loop {
        let mut block = reader.read_block(block_size.max(1))?;
        if block.is_empty() {
            break;
        }
        for row in block.chunks_exact_mut(dim) {
            normalize_in_place(row);
        }
        writer.write_rows(&block)?;
    }
    let rows = writer.finish()?;
    info!(rows, out = %out.display(), "normalized base file for cosine build");
    Ok((out, DistanceMetric::L2))
}

/// What a finished build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub paths: IndexPaths,
    /// Metric the graph was built under (L2 for cosine inputs).
    pub metric: DistanceMetric,
    pub num_nodes: usize,
    pub dim: usize,
    pub num_shards: usize,
    pub pq_chunks: usize,
    pub layout: LayoutHeader,
    pub tuning_sample_points: usize,
}

#[derive(Serialize)]
struct BuildMetadata<'a> {
    crate_version: &'static str,
    params: &'a DiskBuildParams,
    effective_metric: DistanceMetric,
    num_nodes: usize,
    dim: usize,
    num_shards: usize,
    pq_chunks: usize,
    disk_pq_chunks: usize,
    node_len: u32,
    nodes_per_sector: u32,
    reordered: bool,
    medoids: &'a [u32],
    tuning_sample_points: usize,
}

/// Bytes of one node record for these parameters.
fn node_record_len(params: &DiskBuildParams, dim: usize) -> usize {
    let payload = if params.disk_pq_chunks > 0 {
        params.disk_pq_chunks
    } else {
        dim * std::mem::size_of::<f32>()
    };
    4 + payload + 4 + 4 * params.max_degree as usize
}

/// Build with the reference [`ExhaustiveKnnBuilder`] for shard graphs.
pub fn build_disk_index(base: &Path, prefix: impl AsRef<Path>, params: &DiskBuildParams) -> Result<BuildReport> {
    build_disk_index_with(base, prefix, params, &ExhaustiveKnnBuilder)
}

/// Build a disk index for `base` under `prefix` with a caller-supplied shard
/// graph builder.
pub fn build_disk_index_with(
    base: &Path,
    prefix: impl AsRef<Path>,
    params: &DiskBuildParams,
    builder: &dyn ShardGraphBuilder,
) -> Result<BuildReport> {
    params.validate()?;
    let header = read_bin_header::<f32>(base, Phase::Config)?;
    let (npts, dim) = (header.npts, header.dim);
    if npts == 0 || dim == 0 {
        return Err(BuildError::config(
            Phase::Config,
            format!("{} holds {npts}x{dim} vectors; nothing to build", base.display()),
        ));
    }
    if params.disk_pq_chunks > dim {
        return Err(BuildError::config(
            Phase::Config,
            format!("disk_pq_chunks {} exceeds dim {dim}", params.disk_pq_chunks),
        ));
    }
    let node_len = node_record_len(params, dim);
    if node_len > params.sector_size {
        return Err(BuildError::config(
            Phase::Config,
            format!(
                "a node record needs {node_len} bytes (dim {dim}, R {}) but sectors are {} bytes",
                params.max_degree, params.sector_size
            ),
        ));
    }
    let slots_per_sector = params.sector_size / node_len;
    if params.use_sector_reordering && params.omega.is_some_and(|w| w > slots_per_sector) {
        return Err(BuildError::config(
            Phase::Config,
            format!(
                "omega {} exceeds the {slots_per_sector} records that fit a {}-byte sector",
                params.omega.unwrap_or_default(),
                params.sector_size
            ),
        ));
    }

    let paths = IndexPaths::new(prefix);
    let tunables = &params.tunables;
    info!(prefix = paths.prefix(), npts, dim, "starting disk index build");

    let (data, metric) = preprocess_base_file(base, &paths, params.metric, tunables.block_size)?;
    let params = DiskBuildParams {
        metric,
        ..params.clone()
    };

    let pq_budget = get_memory_budget(params.search_ram_budget_gb, tunables)?;
    let pq_chunks = calculate_num_pq_chunks(pq_budget, npts, dim, tunables);
    info!(pq_chunks, budget_bytes = pq_budget, "sized PQ for serving budget");
    generate_pq(&data, &paths.pq_pivots(), &paths.pq_compressed(), pq_chunks, tunables, params.seed)?;
    if params.disk_pq_chunks > 0 {
        generate_pq(
            &data,
            &paths.disk_pq_pivots(),
            &paths.disk_pq_compressed(),
            params.disk_pq_chunks,
            tunables,
            params.seed.wrapping_add(1),
        )?;
    }

    let merged = build_merged_vamana_index(&data, &paths, &params, builder)?;
    info!(
        num_nodes = merged.num_nodes,
        num_shards = merged.num_shards,
        medoids = merged.medoids.len(),
        "merged graph ready"
    );

    let reorder_result = if params.use_sector_reordering {
        reorder(&paths, &params, &merged, node_len).map(Some)
    } else {
        Ok(None)
    };
    remove_files(&merged.shard_idmaps);
    let permutation = reorder_result?;

    let merged_graph = paths.merged_graph();
    let disk_pq = paths.disk_pq_compressed();
    let rerank = paths.rerank_vectors();
    let spec = LayoutSpec {
        graph: &merged_graph,
        vectors: &data,
        pq_codes: (params.disk_pq_chunks > 0).then_some(disk_pq.as_path()),
        medoids: &merged.medoids,
        sector_size: params.sector_size,
        permutation: permutation.as_ref(),
        rerank_vectors: params.rerank_disk_pq.then_some(rerank.as_path()),
    };
    let layout = create_disk_layout(&spec, &paths.disk_index())?;

    let rate = (TUNING_SAMPLE_POINTS / npts as f64).min(1.0);
    let tuning_sample_points =
        write_random_slice(&data, &paths.tuning_sample(), rate, params.seed, tunables)?;
    info!(tuning_sample_points, rate, "wrote tuning sample");

    write_metadata(
        &paths.build_metadata(),
        &BuildMetadata {
            crate_version: env!("CARGO_PKG_VERSION"),
            params: &params,
            effective_metric: metric,
            num_nodes: merged.num_nodes,
            dim,
            num_shards: merged.num_shards,
            pq_chunks,
            disk_pq_chunks: params.disk_pq_chunks,
            node_len: layout.node_len,
            nodes_per_sector: layout.nodes_per_sector,
            reordered: layout.reordered,
            medoids: &merged.medoids,
            tuning_sample_points,
        },
    )?;

    let mut scratch = vec![merged_graph];
    if data.as_path() != base {
        scratch.push(data.clone());
    }
    remove_files(&scratch);

    info!(
        index = %paths.disk_index().display(),
        sectors = layout.num_data_sectors,
        "disk index build complete"
    );
    Ok(BuildReport {
        paths,
        metric,
        num_nodes: merged.num_nodes,
        dim,
        num_shards: merged.num_shards,
        pq_chunks,
        layout,
        tuning_sample_points,
    })
}

fn reorder(
    paths: &IndexPaths,
    params: &DiskBuildParams,
    merged: &MergedGraph,
    node_len: usize,
) -> Result<Permutation> {
    let slots_per_sector = params.sector_size / node_len;
    let omega = params.omega.unwrap_or(slots_per_sector).max(1);
    let parts = if merged.shard_idmaps.is_empty() {
        vec![(0..merged.num_nodes as u32).collect()]
    } else {
        disjoint_parts_from_idmaps(&merged.shard_idmaps, merged.num_nodes)?
    };
    reorder_merged_shards(
        &paths.merged_graph(),
        &parts,
        omega,
        slots_per_sector,
        params.threads,
        &paths.porder(),
        &paths.lorder(),
    )
}

fn write_metadata(path: &Path, metadata: &BuildMetadata<'_>) -> Result<()> {
    let (stage, file) = Staged::create(path, Phase::Layout)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, metadata)
        .map_err(|e| BuildError::corrupt(Phase::Layout, path, e.to_string()))?;
    writer.flush().at(Phase::Layout, path)?;
    drop(writer);
    stage.commit()
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "could not remove intermediate file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::distance::norm;
    use crate::io::{read_bin, write_bin};

    #[test]
    fn cosine_input_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        write_bin(&base, Phase::Config, &[3.0f32, 4.0, 0.0, 2.0, 0.0, 0.0], 3, 2).unwrap();
        let paths = IndexPaths::new(dir.path().join("idx"));

        let (out, metric) = preprocess_base_file(&base, &paths, DistanceMetric::Cosine, 2).unwrap();
        assert_eq!(metric, DistanceMetric::L2);
        let (data, header) = read_bin::<f32>(&out, Phase::Config).unwrap();
        assert_eq!((header.npts, header.dim), (3, 2));
        assert!((norm(&data[0..2]) - 1.0).abs() < 1e-6);
        assert_eq!(&data[4..6], &[0.0, 0.0]);
    }

    #[test]
    fn l2_input_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let paths = IndexPaths::new(dir.path().join("idx"));
        let (out, metric) = preprocess_base_file(&base, &paths, DistanceMetric::L2, 8).unwrap();
        assert_eq!((out, metric), (base, DistanceMetric::L2));
        assert!(!paths.normalized_base().exists());
    }

    #[test]
    fn oversized_record_rejected_before_any_output() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        write_bin(&base, Phase::Config, &vec![0.5f32; 10 * 200], 10, 200).unwrap();
        let params = DiskBuildParams {
            max_degree: 64,
            sector_size: 512,
            tunables: Tunables::small(),
            ..Default::default()
        };
        let err = build_disk_index(&base, dir.path().join("idx"), &params).unwrap_err();
        assert!(matches!(err, BuildError::Config { phase: Phase::Config, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn omega_wider_than_a_sector_rejected_before_any_output() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        write_bin(&base, Phase::Config, &vec![0.5f32; 10 * 8], 10, 8).unwrap();
        // 4 + 32 + 4 + 4 * 16 = 104 bytes per record, four per 512-byte sector.
        let params = DiskBuildParams {
            max_degree: 16,
            sector_size: 512,
            use_sector_reordering: true,
            omega: Some(5),
            tunables: Tunables::small(),
            ..Default::default()
        };
        let err = build_disk_index(&base, dir.path().join("idx"), &params).unwrap_err();
        assert!(matches!(err, BuildError::Config { phase: Phase::Config, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
