//! End-to-end builds on small synthetic datasets.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardann::config::Tunables;
use shardann::distance::l2_squared;
use shardann::io::{load_graph, read_bin, write_bin, GraphWriter};
use shardann::layout::{DiskIndexReader, NodePayload};
use shardann::partitioning::estimate_ram_usage;
use shardann::merge::{merge_shards, DistanceRanker, ShardInput};
use shardann::pipeline::build_disk_index;
use shardann::reorder::Permutation;
use shardann::tune::{
    calculate_recall, load_warmup, optimize_beamwidth, warm_up, QueryEngine, SectorSearchEngine,
    TuningConfig,
};
use shardann::{BuildError, DiskBuildParams, DistanceMetric, Phase};
use std::path::Path;

const N: usize = 400;
const DIM: usize = 8;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn uniform(n: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dim).map(|_| rng.random_range(0.0f32..1.0)).collect()
}

fn brute_force(data: &[f32], query: &[f32], k: usize) -> Vec<u32> {
    let mut all: Vec<(f32, u32)> = data
        .chunks_exact(query.len())
        .enumerate()
        .map(|(i, v)| (l2_squared(query, v), i as u32))
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    all.into_iter().take(k).map(|(_, i)| i).collect()
}

fn small_params() -> DiskBuildParams {
    DiskBuildParams {
        max_degree: 12,
        search_list_size: 24,
        sector_size: 512,
        threads: 2,
        tunables: Tunables::small(),
        ..Default::default()
    }
}

fn write_base(dir: &Path) -> (std::path::PathBuf, Vec<f32>) {
    let base = dir.join("base.bin");
    let data = uniform(N, DIM, 7);
    write_bin(&base, Phase::Config, &data, N, DIM).unwrap();
    (base, data)
}

#[test]
fn full_vector_index_is_searchable() {
    let dir = tempfile::tempdir().unwrap();
    let (base, data) = write_base(dir.path());

    let report = build_disk_index(&base, dir.path().join("idx"), &small_params()).unwrap();
    let paths = &report.paths;
    assert_eq!((report.num_nodes, report.dim, report.num_shards), (N, DIM, 1));
    assert_eq!(report.layout.nodes_per_sector, 1);
    assert!(!report.layout.reordered);
    for p in [
        paths.disk_index(),
        paths.pq_pivots(),
        paths.pq_compressed(),
        paths.tuning_sample(),
        paths.build_metadata(),
    ] {
        assert!(p.exists(), "{} missing", p.display());
    }
    assert!(!paths.merged_graph().exists());

    let meta: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(paths.build_metadata()).unwrap()).unwrap();
    assert_eq!(meta["num_nodes"], N);
    assert_eq!(meta["params"]["max_degree"], 12);

    let reader = DiskIndexReader::open(&paths.disk_index()).unwrap();
    for node in 0..N as u32 {
        let rec = reader.read_node(node).unwrap();
        assert!(rec.neighbors.len() <= 12);
        assert!(rec.neighbors.iter().all(|&v| (v as usize) < N));
        let i = node as usize;
        assert_eq!(rec.payload, NodePayload::Full(data[i * DIM..(i + 1) * DIM].to_vec()));
    }

    let engine = SectorSearchEngine::from_paths(paths, report.metric).unwrap();
    let queries = uniform(30, DIM, 99);
    let mut truth = Vec::new();
    let mut found = Vec::new();
    for q in queries.chunks_exact(DIM) {
        truth.push(brute_force(&data, q, 5));
        found.push(engine.search(q, 5, 40, 4).unwrap().ids);
    }
    let recall = calculate_recall(&truth, None, &found, 5);
    assert!(recall >= 0.8, "recall {recall}");

    let (sample, header) = read_bin::<f32>(&paths.tuning_sample(), Phase::Tune).unwrap();
    assert_eq!(header.npts, report.tuning_sample_points);
    let tuned = optimize_beamwidth(&engine, &sample, DIM, &TuningConfig::new(24, 2, 2)).unwrap();
    assert!((2..=64).contains(&tuned.best_beamwidth));
    assert!(!tuned.trials.is_empty());

    let tunables = Tunables::small();
    let warm = load_warmup(&paths.tuning_sample(), DIM, &tunables).unwrap().unwrap();
    assert_eq!(warm.num_points(), header.npts.min(tunables.warmup_limit()));
    assert_eq!(warm_up(&engine, &warm, tuned.best_beamwidth, &tunables, 2).unwrap(), warm.num_points());
}

#[test]
fn reordered_pq_layout_with_rerank_file() {
    let dir = tempfile::tempdir().unwrap();
    let (base, data) = write_base(dir.path());
    let params = DiskBuildParams {
        disk_pq_chunks: 4,
        rerank_disk_pq: true,
        use_sector_reordering: true,
        ..small_params()
    };

    let report = build_disk_index(&base, dir.path().join("idx"), &params).unwrap();
    let paths = &report.paths;
    // 4 id + 4 codes + 4 degree + 48 neighbours.
    assert_eq!(report.layout.node_len, 60);
    assert_eq!(report.layout.nodes_per_sector, 8);
    assert!(report.layout.reordered);

    let perm = Permutation::load(&paths.porder()).unwrap();
    assert_eq!(perm.num_nodes(), N);
    assert!(perm.num_slots() >= N);
    let (lorder, _) = read_bin::<u32>(&paths.lorder(), Phase::Reorder).unwrap();
    assert_eq!(lorder, perm.location());

    let (disk_codes, code_shape) = read_bin::<u8>(&paths.disk_pq_compressed(), Phase::Layout).unwrap();
    assert_eq!((code_shape.npts, code_shape.dim), (N, 4));
    let reader = DiskIndexReader::open(&paths.disk_index()).unwrap();
    assert!(reader.num_slots() >= perm.num_slots() as u64);
    for node in 0..N as u32 {
        let rec = reader.read_node(node).unwrap();
        let i = node as usize;
        assert_eq!(rec.payload, NodePayload::Pq(disk_codes[i * 4..(i + 1) * 4].to_vec()));
        assert_eq!(reader.position_of(node).unwrap(), perm.position_of(node) as u64);
    }

    let (rerank, header) = read_bin::<f32>(&paths.rerank_vectors(), Phase::Layout).unwrap();
    assert_eq!((header.npts, header.dim), (N, DIM));
    assert_eq!(rerank, data);

    let engine = SectorSearchEngine::from_paths(paths, report.metric).unwrap();
    let out = engine.search(&data[..DIM], 3, 60, 2).unwrap();
    assert_eq!(out.ids.len(), 3);
    assert_eq!(out.ids[0], 0);
    assert!(out.stats.n_ios >= 1);
}

#[test]
fn short_rerank_file_refused_by_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (base, data) = write_base(dir.path());
    let params = DiskBuildParams {
        disk_pq_chunks: 4,
        rerank_disk_pq: true,
        ..small_params()
    };
    let report = build_disk_index(&base, dir.path().join("idx"), &params).unwrap();
    let paths = &report.paths;

    write_bin(&paths.rerank_vectors(), Phase::Layout, &data[DIM..], N - 1, DIM).unwrap();
    let err = SectorSearchEngine::from_paths(paths, report.metric).err().unwrap();
    assert!(matches!(err, BuildError::Corrupt { phase: Phase::Tune, .. }), "{err}");

    write_bin(&paths.rerank_vectors(), Phase::Layout, &data[..N * 4], N, 4).unwrap();
    let err = SectorSearchEngine::from_paths(paths, report.metric).err().unwrap();
    assert!(matches!(err, BuildError::DimensionMismatch { phase: Phase::Tune, .. }), "{err}");
}

#[test]
fn partitioned_build_with_sector_reordering() {
    let dir = tempfile::tempdir().unwrap();
    let (base, data) = write_base(dir.path());
    let params = DiskBuildParams {
        sampling_rate: Some(1.0),
        build_ram_budget_gb: estimate_ram_usage(N as u64 * 3 / 5, DIM, 4, 12) / GIB,
        use_sector_reordering: true,
        ..small_params()
    };

    let report = build_disk_index(&base, dir.path().join("idx"), &params).unwrap();
    let paths = &report.paths;
    assert!(report.num_shards >= 3, "{} shards", report.num_shards);
    assert_eq!(report.num_nodes, N);
    assert!(report.layout.reordered);
    // 4 id + 32 vector + 4 degree + 48 neighbours.
    assert_eq!(report.layout.nodes_per_sector, 5);
    for shard in 0..report.num_shards {
        assert!(!paths.shard_idmap(shard).exists());
        assert!(!paths.shard_graph(shard).exists());
    }
    assert!(!paths.merged_graph().exists());

    let perm = Permutation::load(&paths.porder()).unwrap();
    assert_eq!(perm.num_nodes(), N);
    let (lorder, _) = read_bin::<u32>(&paths.lorder(), Phase::Reorder).unwrap();
    assert_eq!(lorder, perm.location());

    let reader = DiskIndexReader::open(&paths.disk_index()).unwrap();
    for node in 0..N as u32 {
        let rec = reader.read_node(node).unwrap();
        let i = node as usize;
        assert_eq!(rec.payload, NodePayload::Full(data[i * DIM..(i + 1) * DIM].to_vec()));
        assert!(rec.neighbors.iter().all(|&v| (v as usize) < N));
        assert_eq!(reader.position_of(node).unwrap(), perm.position_of(node) as u64);
    }

    let engine = SectorSearchEngine::from_paths(paths, report.metric).unwrap();
    let out = engine.search(&data[5 * DIM..6 * DIM], 3, 40, 4).unwrap();
    assert_eq!(out.ids.len(), 3);
}

#[test]
fn cosine_build_runs_under_l2_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let (base, _) = write_base(dir.path());
    let params = DiskBuildParams {
        metric: DistanceMetric::Cosine,
        ..small_params()
    };
    let report = build_disk_index(&base, dir.path().join("idx"), &params).unwrap();
    assert_eq!(report.metric, DistanceMetric::L2);
    assert!(!report.paths.normalized_base().exists());

    let reader = DiskIndexReader::open(&report.paths.disk_index()).unwrap();
    let NodePayload::Full(v) = reader.read_node(3).unwrap().payload else {
        panic!("expected full vectors");
    };
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

/// Node 42 collects six edges from each of two shards; the merge keeps the
/// ten closest.
#[test]
fn two_shard_overlap_prunes_by_distance() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("line.bin");
    let line: Vec<f32> = (0..50).flat_map(|i| [i as f32, 0.0]).collect();
    write_bin(&base, Phase::Merge, &line, 50, 2).unwrap();

    // Shard A holds 0..=42, shard B holds 40..50.
    let a_ids: Vec<u32> = (0..=42).collect();
    let b_ids: Vec<u32> = (40..50).collect();
    let a_adj: Vec<Vec<u32>> = (0..43u32)
        .map(|i| if i == 42 { (30..36).collect() } else { vec![(i + 1) % 43] })
        .collect();
    let b_adj: Vec<Vec<u32>> = (0..10u32)
        .map(|i| if i == 2 { (4..10).collect() } else { vec![(i + 1) % 10] })
        .collect();

    let mut shards = Vec::new();
    for (name, ids, adj) in [("a", &a_ids, &a_adj), ("b", &b_ids, &b_adj)] {
        let graph = dir.path().join(format!("{name}.graph"));
        let idmap = dir.path().join(format!("{name}.ids"));
        write_bin(&idmap, Phase::Merge, ids, ids.len(), 1).unwrap();
        let mut w = GraphWriter::create(&graph, Phase::Merge, 6, 0).unwrap();
        for list in adj {
            w.write_node(list).unwrap();
        }
        w.finish().unwrap();
        shards.push(ShardInput { graph, idmap });
    }

    let out = dir.path().join("merged.graph");
    let medoids = dir.path().join("medoids.bin");
    let ranker = DistanceRanker::open(&base, DistanceMetric::L2).unwrap();
    let outcome = merge_shards(&shards, &out, &medoids, 10, &ranker, 3).unwrap();
    assert_eq!(outcome.num_nodes, 50);
    assert_eq!(outcome.medoids, vec![0, 40]);
    assert_eq!(outcome.max_accumulated_degree, 12);

    let (header, adj) = load_graph(&out, Phase::Merge, Some(50)).unwrap();
    assert_eq!(header.max_degree, 10);
    let mut kept = adj[42].clone();
    kept.sort_unstable();
    assert_eq!(kept, vec![32, 33, 34, 35, 44, 45, 46, 47, 48, 49]);
    // Node 41 gets the same edge from both shards.
    assert_eq!(adj[41], vec![42]);
}
