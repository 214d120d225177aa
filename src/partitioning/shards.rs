//! RAM-budgeted shard partitioning.

use super::kmeans::{best_of_restarts, KMeans};
use crate::config::Tunables;
use crate::error::{BuildError, Phase, Result};
use crate::io::{write_bin, BinReader, BinWriter, IndexPaths};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Headroom for adjacency lists that temporarily exceed R during build.
const GRAPH_SLACK: f64 = 1.3;
/// Allocator and bookkeeping overhead.
const OVERHEAD_FACTOR: f64 = 1.1;
/// k-means restarts used when sizing shards.
const PARTITION_KMEANS_REPS: usize = 1;
const PARTITION_KMEANS_ITERATIONS: usize = 10;
/// Smallest shard count tried.
const MIN_PARTS: usize = 3;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Estimated bytes needed to build a graph over `size` points in memory.
pub fn estimate_ram_usage(size: u64, dim: usize, datasize: usize, degree: usize) -> f64 {
    let size = size as f64;
    let size_of_data = size * dim.next_multiple_of(8) as f64 * datasize as f64;
    let size_of_graph = size * degree as f64 * std::mem::size_of::<u32>() as f64 * GRAPH_SLACK;
    let size_of_locks = size * std::mem::size_of::<std::sync::Mutex<()>>() as f64;
    let size_of_outer_vector = size * std::mem::size_of::<Vec<u32>>() as f64;
    OVERHEAD_FACTOR * (size_of_data + size_of_graph + size_of_locks + size_of_outer_vector)
}

/// Bernoulli-sample rows of a base file at `rate`. Returns the sampled rows,
/// their count and the dimension.
pub fn gen_random_slice(
    base: &Path,
    rate: f64,
    seed: u64,
    tunables: &Tunables,
) -> Result<(Vec<f32>, usize, usize)> {
    let rate = rate.clamp(0.0, 1.0);
    let mut reader = BinReader::<f32>::open(base, Phase::Partition)?;
    let dim = reader.header().dim;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sample = Vec::new();

    loop {
        let block = reader.read_block(tunables.block_size)?;
        if block.is_empty() {
            break;
        }
        for row in block.chunks_exact(dim) {
            if rng.random_bool(rate) {
                sample.extend_from_slice(row);
            }
        }
    }

    let n = sample.len() / dim.max(1);
    debug!(base = %base.display(), rate, sampled = n, "generated random slice");
    Ok((sample, n, dim))
}

/// [`gen_random_slice`] written to `out` as a bin file.
pub fn write_random_slice(
    base: &Path,
    out: &Path,
    rate: f64,
    seed: u64,
    tunables: &Tunables,
) -> Result<usize> {
    let (sample, n, dim) = gen_random_slice(base, rate, seed, tunables)?;
    write_bin(out, Phase::Partition, &sample, n, dim)?;
    Ok(n)
}

/// Result of partitioning.
#[derive(Debug, Clone)]
pub struct PartitionSummary {
    pub num_shards: usize,
    pub shard_sizes: Vec<usize>,
    pub dim: usize,
}

/// Choose a shard count whose largest shard fits `ram_budget_gb`, then write
/// shard data and id-map files plus the shard centroids.
#[allow(clippy::too_many_arguments)]
pub fn partition_with_ram_budget(
    base: &Path,
    sampling_rate: f64,
    ram_budget_gb: f64,
    graph_degree: usize,
    paths: &IndexPaths,
    k_base: usize,
    tunables: &Tunables,
    seed: u64,
) -> Result<PartitionSummary> {
    if !(ram_budget_gb > 0.0) {
        return Err(BuildError::config(
            Phase::Partition,
            format!("build RAM budget must be positive, got {ram_budget_gb} GB"),
        ));
    }
    let (sample, num_sample, dim) = gen_random_slice(base, sampling_rate, seed, tunables)?;
    if num_sample == 0 {
        return Err(BuildError::config(
            Phase::Partition,
            format!(
                "sampling rate {sampling_rate} drew no points from {}",
                base.display()
            ),
        ));
    }
    let budget_bytes = ram_budget_gb * GIB;

    let mut num_parts = MIN_PARTS;
    let kmeans = loop {
        if num_parts > num_sample {
            return Err(BuildError::config(
                Phase::Partition,
                format!(
                    "no shard count up to {num_sample} fits a {ram_budget_gb} GB build budget"
                ),
            ));
        }
        let (km, _) = best_of_restarts(
            &sample,
            num_sample,
            dim,
            num_parts,
            PARTITION_KMEANS_REPS,
            PARTITION_KMEANS_ITERATIONS,
            seed,
            Phase::Partition,
        )?;

        let k = k_base.min(num_parts);
        let mut counts = vec![0usize; num_parts];
        for row in sample.chunks_exact(dim) {
            for c in km.nearest_n(row, k) {
                counts[c] += 1;
            }
        }
        let max_count = counts.iter().copied().max().unwrap_or(0);
        let est_shard = (max_count as f64 / sampling_rate).ceil() as u64;
        let est_ram = estimate_ram_usage(est_shard, dim, std::mem::size_of::<f32>(), graph_degree);

        info!(
            num_parts,
            est_max_shard = est_shard,
            est_ram_gb = est_ram / GIB,
            budget_gb = ram_budget_gb,
            "evaluated shard count"
        );
        if est_ram <= budget_bytes {
            break km;
        }
        num_parts += 1;
    };

    write_bin(
        &paths.centroids(),
        Phase::Partition,
        kmeans.centroids(),
        num_parts,
        dim,
    )?;
    let shard_sizes = shard_data_into_clusters(base, &kmeans, k_base, paths, tunables)?;
    info!(num_shards = num_parts, ?shard_sizes, "partitioned base file");

    Ok(PartitionSummary {
        num_shards: num_parts,
        shard_sizes,
        dim,
    })
}

/// Stream the base file and write each point to its `k_base` nearest shards.
/// Id maps list global ids in ascending order.
pub fn shard_data_into_clusters(
    base: &Path,
    kmeans: &KMeans,
    k_base: usize,
    paths: &IndexPaths,
    tunables: &Tunables,
) -> Result<Vec<usize>> {
    let mut reader = BinReader::<f32>::open(base, Phase::Partition)?;
    let dim = reader.header().dim;
    if dim != kmeans.dimension() {
        return Err(BuildError::DimensionMismatch {
            phase: Phase::Partition,
            path: base.to_path_buf(),
            expected: kmeans.dimension(),
            actual: dim,
        });
    }
    let num_shards = kmeans.k();
    let k = k_base.min(num_shards).max(1);

    let mut data_writers = Vec::with_capacity(num_shards);
    let mut id_writers = Vec::with_capacity(num_shards);
    for shard in 0..num_shards {
        data_writers.push(BinWriter::<f32>::create(
            &paths.shard_data(shard),
            Phase::Partition,
            dim,
        )?);
        id_writers.push(BinWriter::<u32>::create(
            &paths.shard_idmap(shard),
            Phase::Partition,
            1,
        )?);
    }

    let mut next_id = 0u32;
    loop {
        let block = reader.read_block(tunables.block_size)?;
        if block.is_empty() {
            break;
        }
        let assignments: Vec<Vec<usize>> = block
            .par_chunks_exact(dim)
            .map(|row| kmeans.nearest_n(row, k))
            .collect();

        for (row, shards) in block.chunks_exact(dim).zip(&assignments) {
            for &shard in shards {
                data_writers[shard].write_rows(row)?;
                id_writers[shard].write_rows(&[next_id])?;
            }
            next_id += 1;
        }
    }

    let mut sizes = Vec::with_capacity(num_shards);
    for (data, ids) in data_writers.into_iter().zip(id_writers) {
        let n = data.finish()?;
        ids.finish()?;
        sizes.push(n);
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{read_bin, read_idmap};

    fn clustered(n_per: usize, dim: usize) -> Vec<f32> {
        let mut v = Vec::new();
        for c in 0..4 {
            for i in 0..n_per {
                for d in 0..dim {
                    v.push(c as f32 * 100.0 + ((i * 7 + d) % 5) as f32 * 0.1);
                }
            }
        }
        v
    }

    #[test]
    fn ram_estimate_grows_with_size_and_degree() {
        let a = estimate_ram_usage(1_000, 128, 4, 32);
        let b = estimate_ram_usage(2_000, 128, 4, 32);
        let c = estimate_ram_usage(1_000, 128, 4, 64);
        assert!(b > a && c > a);
        assert!((b / a - 2.0).abs() < 1e-9);
    }

    #[test]
    fn slice_rate_one_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let data = clustered(10, 4);
        write_bin(&base, Phase::Partition, &data, 40, 4).unwrap();

        let (sample, n, dim) = gen_random_slice(&base, 1.0, 1, &Tunables::small()).unwrap();
        assert_eq!((n, dim), (40, 4));
        assert_eq!(sample, data);
    }

    #[test]
    fn every_point_lands_in_k_base_shards() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        write_bin(&base, Phase::Partition, &clustered(25, 4), 100, 4).unwrap();
        let paths = IndexPaths::new(dir.path().join("idx"));

        // Tiny budget forces more than the minimum shard count.
        let summary = partition_with_ram_budget(
            &base,
            1.0,
            estimate_ram_usage(60, 4, 4, 8) / GIB,
            8,
            &paths,
            2,
            &Tunables::small(),
            11,
        )
        .unwrap();

        assert!(summary.num_shards >= 3);
        let total: usize = summary.shard_sizes.iter().sum();
        assert_eq!(total, 200);

        let mut seen = vec![0usize; 100];
        for shard in 0..summary.num_shards {
            let ids = read_idmap(&paths.shard_idmap(shard), Phase::Partition).unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            let (_, header) = read_bin::<f32>(&paths.shard_data(shard), Phase::Partition).unwrap();
            assert_eq!(header.npts, ids.len());
            for id in ids {
                seen[id as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 2));
        assert!(paths.centroids().exists());
    }

    #[test]
    fn impossible_budget_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        write_bin(&base, Phase::Partition, &clustered(3, 4), 12, 4).unwrap();
        let paths = IndexPaths::new(dir.path().join("idx"));

        let err = partition_with_ram_budget(&base, 1.0, 1e-12, 8, &paths, 2, &Tunables::small(), 1)
            .unwrap_err();
        assert!(matches!(err, BuildError::Config { phase: Phase::Partition, .. }));
        assert!(!paths.shard_data(0).exists());
    }
}
