//! Property-based tests for the build phases.
//!
//! - Merged graphs have no dangling edges and respect the degree bound
//! - Reordering yields a bijection for any thread count
//! - A layout either fits every record in a sector or fails with a capacity error
//! - Recall stays in [0, 1]

use proptest::prelude::*;
use shardann::io::{load_graph, write_bin, GraphWriter};
use shardann::layout::{create_disk_layout, LayoutSpec};
use shardann::merge::{merge_shards, IdOrderRanker, ShardInput};
use shardann::reorder::{greedy_ordering, Permutation, ReorderGraph};
use shardann::tune::calculate_recall;
use shardann::{BuildError, Phase};
use std::path::Path;

fn write_shard(dir: &Path, name: &str, ids: &[u32], adj: &[Vec<u32>], max_degree: u32) -> ShardInput {
    let graph = dir.join(format!("{name}.graph"));
    let idmap = dir.join(format!("{name}.ids"));
    write_bin(&idmap, Phase::Merge, ids, ids.len(), 1).unwrap();
    let mut w = GraphWriter::create(&graph, Phase::Merge, max_degree, 0).unwrap();
    for list in adj {
        w.write_node(list).unwrap();
    }
    w.finish().unwrap();
    ShardInput { graph, idmap }
}

mod merge_props {
    use super::*;

    prop_compose! {
        /// Membership per node (1 = shard A, 2 = shard B, 3 = both; node 0
        /// is in both) and raw edge targets per node per shard.
        fn arb_shards()(n in 2usize..40)(
            membership in prop::collection::vec(1u8..=3, n - 1),
            edges in prop::collection::vec(prop::collection::vec(any::<u32>(), 0..8), 2 * n),
        ) -> (Vec<u8>, Vec<Vec<u32>>) {
            let mut m = vec![3u8];
            m.extend(membership);
            (m, edges)
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn merged_graph_is_closed_and_bounded(
            (membership, edges) in arb_shards(),
            max_degree in 1u32..6,
            workers in 1usize..4,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let n = membership.len();
            let a_ids: Vec<u32> = (0..n as u32).filter(|&g| membership[g as usize] & 1 != 0).collect();
            let b_ids: Vec<u32> = (0..n as u32).filter(|&g| membership[g as usize] & 2 != 0).collect();

            let local = |ids: &[u32], offset: usize| -> Vec<Vec<u32>> {
                (0..ids.len())
                    .map(|i| {
                        edges[offset + i]
                            .iter()
                            .map(|&e| e % ids.len() as u32)
                            .collect()
                    })
                    .collect()
            };
            let a = write_shard(dir.path(), "a", &a_ids, &local(&a_ids, 0), 8);
            let b = write_shard(dir.path(), "b", &b_ids, &local(&b_ids, n), 8);

            let out = dir.path().join("merged.graph");
            let med = dir.path().join("medoids.bin");
            let outcome = merge_shards(&[a, b], &out, &med, max_degree, &IdOrderRanker, workers).unwrap();
            prop_assert_eq!(outcome.num_nodes, n);

            let (_, adj) = load_graph(&out, Phase::Merge, Some(n)).unwrap();
            for list in &adj {
                prop_assert!(list.len() <= max_degree as usize);
                prop_assert!(list.iter().all(|&v| (v as usize) < n));
                let mut sorted = list.clone();
                sorted.sort_unstable();
                sorted.dedup();
                prop_assert_eq!(sorted.len(), list.len());
            }
        }
    }
}

mod reorder_props {
    use super::*;

    prop_compose! {
        fn arb_graph()(n in 1usize..150)(
            out in prop::collection::vec(prop::collection::vec(0u32..150, 0..10), n),
        ) -> Vec<Vec<u32>> {
            out
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn ordering_is_a_bijection(
            out in arb_graph(),
            omega in 1usize..9,
            threads in 1usize..5,
        ) {
            let n = out.len();
            let graph = ReorderGraph::from_out_edges(out);
            let order = greedy_ordering(&graph, omega, threads).concat();
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..n as u32).collect::<Vec<_>>());
            prop_assert!(Permutation::from_order(order).is_ok());
        }

        #[test]
        fn groups_fit_one_sector(
            out in arb_graph(),
            omega in 1usize..9,
            spare in 0usize..4,
            threads in 1usize..5,
        ) {
            let n = out.len();
            let graph = ReorderGraph::from_out_edges(out);
            let groups = greedy_ordering(&graph, omega, threads);
            prop_assert!(groups.iter().all(|g| !g.is_empty() && g.len() <= omega));

            let slots = omega + spare;
            let perm = Permutation::from_groups(&groups, slots).unwrap();
            prop_assert_eq!(perm.num_nodes(), n);
            for group in &groups {
                let first = perm.position_of(group[0]) as usize / slots;
                prop_assert!(group.iter().all(|&v| perm.position_of(v) as usize / slots == first));
            }
        }

        #[test]
        fn single_thread_is_deterministic(out in arb_graph(), omega in 1usize..9) {
            let graph = ReorderGraph::from_out_edges(out);
            prop_assert_eq!(greedy_ordering(&graph, omega, 1), greedy_ordering(&graph, omega, 1));
        }
    }
}

mod layout_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn records_fit_or_capacity_error(
            dim in 1usize..160,
            max_degree in 1u32..128,
            sector_kb in 0usize..2,
            reordered in any::<bool>(),
        ) {
            let sector_size = 512 << sector_kb;
            let dir = tempfile::tempdir().unwrap();
            let graph = dir.path().join("g.index");
            let vectors = dir.path().join("v.bin");
            let output = dir.path().join("disk.index");

            let mut w = GraphWriter::create(&graph, Phase::Merge, max_degree, 0).unwrap();
            for i in 0..3u32 {
                w.write_node(&[(i + 1) % 3]).unwrap();
            }
            w.finish().unwrap();
            write_bin(&vectors, Phase::Layout, &vec![1.0f32; 3 * dim], 3, dim).unwrap();

            let perm = Permutation::from_order(vec![2, 0, 1]).unwrap();
            let spec = LayoutSpec {
                graph: &graph,
                vectors: &vectors,
                pq_codes: None,
                medoids: &[0],
                sector_size,
                permutation: reordered.then_some(&perm),
                rerank_vectors: None,
            };
            let record_len = 4 + 4 * dim + 4 + 4 * max_degree as usize;
            match create_disk_layout(&spec, &output) {
                Ok(header) => {
                    prop_assert!(record_len <= sector_size);
                    prop_assert_eq!(header.node_len as usize, record_len);
                    prop_assert!(header.nodes_per_sector as usize * record_len <= sector_size);
                }
                Err(BuildError::Capacity { record_len: got, .. }) => {
                    prop_assert!(record_len > sector_size);
                    prop_assert_eq!(got, record_len);
                    prop_assert!(!output.exists());
                }
                Err(e) => prop_assert!(false, "unexpected error: {e}"),
            }
        }
    }
}

mod recall_props {
    use super::*;

    proptest! {
        #[test]
        fn recall_is_a_fraction(
            gt in prop::collection::vec(prop::collection::vec(0u32..50, 0..12), 1..10),
            res in prop::collection::vec(prop::collection::vec(0u32..50, 0..12), 1..10),
            k in 1usize..12,
        ) {
            let res: Vec<Vec<u32>> = res
                .into_iter()
                .map(|mut r| { r.sort_unstable(); r.dedup(); r })
                .collect();
            let r = calculate_recall(&gt, None, &res, k);
            prop_assert!((0.0..=1.0).contains(&r), "recall {}", r);
        }
    }
}
