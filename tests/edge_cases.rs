//! Failure modes: every one must name its phase and leave no published
//! artifact behind.

use shardann::config::Tunables;
use shardann::io::{write_bin, GraphWriter, IndexPaths};
use shardann::layout::{create_disk_layout, DiskIndexReader, LayoutSpec};
use shardann::merge::{merge_shards, IdOrderRanker, ShardInput};
use shardann::pipeline::build_disk_index;
use shardann::reorder::{disjoint_parts_from_idmaps, Permutation};
use shardann::tune::load_warmup;
use shardann::{BuildError, DiskBuildParams, Phase};
use std::path::Path;

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn rerank_without_disk_pq_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.bin");
    write_bin(&base, Phase::Config, &[0.0f32; 8], 2, 4).unwrap();
    let params = DiskBuildParams {
        rerank_disk_pq: true,
        tunables: Tunables::small(),
        ..Default::default()
    };
    let err = build_disk_index(&base, dir.path().join("idx"), &params).unwrap_err();
    assert_eq!(err.phase(), Phase::Config);
    assert_eq!(files_in(dir.path()), vec!["base.bin"]);
}

#[test]
fn empty_base_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.bin");
    write_bin::<f32>(&base, Phase::Config, &[], 0, 4).unwrap();
    let err = build_disk_index(&base, dir.path().join("idx"), &DiskBuildParams::default()).unwrap_err();
    assert!(matches!(err, BuildError::Config { .. }));
}

#[test]
fn truncated_base_file_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.bin");
    write_bin(&base, Phase::Config, &[1.0f32; 12], 3, 4).unwrap();
    let bytes = std::fs::read(&base).unwrap();
    std::fs::write(&base, &bytes[..bytes.len() - 4]).unwrap();

    let err = build_disk_index(&base, dir.path().join("idx"), &DiskBuildParams::default()).unwrap_err();
    assert!(matches!(err, BuildError::Corrupt { .. }));
    assert!(err.to_string().contains("base.bin"));
}

#[test]
fn truncated_shard_graph_aborts_merge() {
    let dir = tempfile::tempdir().unwrap();
    let mut shards = Vec::new();
    for (name, ids) in [("a", vec![0u32, 1, 2]), ("b", vec![2u32, 3])] {
        let graph = dir.path().join(format!("{name}.graph"));
        let idmap = dir.path().join(format!("{name}.ids"));
        write_bin(&idmap, Phase::Merge, &ids, ids.len(), 1).unwrap();
        let mut w = GraphWriter::create(&graph, Phase::Merge, 2, 0).unwrap();
        for i in 0..ids.len() as u32 {
            w.write_node(&[(i + 1) % ids.len() as u32]).unwrap();
        }
        w.finish().unwrap();
        shards.push(ShardInput { graph, idmap });
    }
    let bytes = std::fs::read(&shards[1].graph).unwrap();
    std::fs::write(&shards[1].graph, &bytes[..bytes.len() - 2]).unwrap();

    let out = dir.path().join("merged.graph");
    let med = dir.path().join("medoids.bin");
    let err = merge_shards(&shards, &out, &med, 2, &IdOrderRanker, 2).unwrap_err();
    assert_eq!(err.phase(), Phase::Merge);
    assert!(!out.exists());
    assert!(!med.exists());
    assert!(files_in(dir.path()).iter().all(|f| !f.ends_with(".tmp")));
}

#[test]
fn capacity_error_leaves_no_layout() {
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("g.index");
    let vectors = dir.path().join("v.bin");
    let output = dir.path().join("disk.index");

    let mut w = GraphWriter::create(&graph, Phase::Merge, 100, 0).unwrap();
    w.write_node(&[1]).unwrap();
    w.write_node(&[0]).unwrap();
    w.finish().unwrap();
    write_bin(&vectors, Phase::Layout, &vec![0.0f32; 2 * 32], 2, 32).unwrap();

    let spec = LayoutSpec {
        graph: &graph,
        vectors: &vectors,
        pq_codes: None,
        medoids: &[0],
        sector_size: 512,
        permutation: None,
        rerank_vectors: None,
    };
    // 4 + 128 + 4 + 400 = 536 bytes.
    let err = create_disk_layout(&spec, &output).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Capacity {
            record_len: 536,
            sector_size: 512,
            ..
        }
    ));
    assert!(!output.exists());
}

#[test]
fn truncated_layout_is_rejected_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("g.index");
    let vectors = dir.path().join("v.bin");
    let output = dir.path().join("disk.index");

    let mut w = GraphWriter::create(&graph, Phase::Merge, 2, 0).unwrap();
    for i in 0..4u32 {
        w.write_node(&[(i + 1) % 4]).unwrap();
    }
    w.finish().unwrap();
    write_bin(&vectors, Phase::Layout, &[0.5f32; 8], 4, 2).unwrap();
    let spec = LayoutSpec {
        graph: &graph,
        vectors: &vectors,
        pq_codes: None,
        medoids: &[0],
        sector_size: 512,
        permutation: None,
        rerank_vectors: None,
    };
    create_disk_layout(&spec, &output).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    std::fs::write(&output, &bytes[..bytes.len() - 512]).unwrap();
    assert!(matches!(
        DiskIndexReader::open(&output),
        Err(BuildError::Corrupt { phase: Phase::Layout, .. })
    ));
}

#[test]
fn duplicate_positions_are_not_a_permutation() {
    assert!(matches!(
        Permutation::from_order(vec![0, 2, 2]),
        Err(BuildError::InvalidPermutation(_))
    ));
}

#[test]
fn overlapping_idmaps_give_each_node_one_part() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IndexPaths::new(dir.path().join("idx"));
    write_bin(&paths.shard_idmap(0), Phase::Partition, &[0u32, 1, 3], 3, 1).unwrap();
    write_bin(&paths.shard_idmap(1), Phase::Partition, &[1u32, 2, 3, 4], 4, 1).unwrap();

    let parts =
        disjoint_parts_from_idmaps(&[paths.shard_idmap(0), paths.shard_idmap(1)], 5).unwrap();
    assert_eq!(parts, vec![vec![0, 1, 3], vec![2, 4]]);

    let err = disjoint_parts_from_idmaps(&[paths.shard_idmap(0)], 5).unwrap_err();
    assert_eq!(err.phase(), Phase::Reorder);
}

#[test]
fn warmup_missing_is_cold_but_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let sample = dir.path().join("sample.bin");
    assert!(load_warmup(&sample, 4, &Tunables::small()).unwrap().is_none());

    write_bin(&sample, Phase::Tune, &[0.0f32; 6], 2, 3).unwrap();
    let err = load_warmup(&sample, 4, &Tunables::small()).unwrap_err();
    assert_eq!(err.phase(), Phase::Warmup);
}
