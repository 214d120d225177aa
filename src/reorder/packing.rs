//! Greedy sector packing.

use super::bitset::AtomicBitSet;
use rayon::prelude::*;
use std::collections::HashMap;

/// Directed adjacency over dense local ids, with its reverse.
#[derive(Debug, Clone, Default)]
pub struct ReorderGraph {
    out_graph: Vec<Vec<u32>>,
    in_graph: Vec<Vec<u32>>,
}

impl ReorderGraph {
    /// Build from out-edges; edges to ids `>= out.len()` are dropped.
    pub fn from_out_edges(mut out_graph: Vec<Vec<u32>>) -> Self {
        let n = out_graph.len();
        let mut in_graph = vec![Vec::new(); n];
        for (u, nbrs) in out_graph.iter_mut().enumerate() {
            nbrs.retain(|&v| (v as usize) < n && v as usize != u);
            for &v in nbrs.iter() {
                in_graph[v as usize].push(u as u32);
            }
        }
        Self {
            out_graph,
            in_graph,
        }
    }

    pub fn len(&self) -> usize {
        self.out_graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out_graph.is_empty()
    }

    pub fn out_neighbors(&self, u: u32) -> &[u32] {
        &self.out_graph[u as usize]
    }

    pub fn in_neighbors(&self, u: u32) -> &[u32] {
        &self.in_graph[u as usize]
    }
}

/// Fill one sector group of up to `omega` nodes starting at `seed`.
///
/// Candidates are scored against the nodes already in the group: +1 per
/// edge from a group member, +1 per edge into a group member, and +1 per
/// shared in-neighbour. The highest score is claimed first, ties to the lower
/// id; a candidate already claimed elsewhere is skipped for the next one.
/// Returns an empty group if `seed` was already claimed.
pub fn partition_packing(
    graph: &ReorderGraph,
    deleted: &AtomicBitSet,
    seed: u32,
    omega: usize,
) -> Vec<u32> {
    if !deleted.test_and_set(seed as usize) {
        return Vec::new();
    }
    let mut group = vec![seed];
    let mut scores: HashMap<u32, u32> = HashMap::new();
    add_contributions(graph, deleted, seed, &mut scores);

    while group.len() < omega.max(1) {
        let mut ranked: Vec<(u32, u32)> = scores
            .iter()
            .filter(|&(&v, _)| !deleted.get(v as usize))
            .map(|(&v, &s)| (v, s))
            .collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let Some(claimed) = ranked
            .into_iter()
            .map(|(v, _)| v)
            .find(|&v| deleted.test_and_set(v as usize))
        else {
            break;
        };
        scores.remove(&claimed);
        group.push(claimed);
        add_contributions(graph, deleted, claimed, &mut scores);
    }
    group
}

fn add_contributions(
    graph: &ReorderGraph,
    deleted: &AtomicBitSet,
    member: u32,
    scores: &mut HashMap<u32, u32>,
) {
    let mut bump = |v: u32| {
        if !deleted.get(v as usize) {
            *scores.entry(v).or_insert(0) += 1;
        }
    };
    for &v in graph.out_neighbors(member) {
        bump(v);
    }
    for &w in graph.in_neighbors(member) {
        bump(w);
        for &sibling in graph.out_neighbors(w) {
            if sibling != member {
                bump(sibling);
            }
        }
    }
}

/// Seeds for one worker: its slice of ids, highest in-degree first, ties to
/// the lower id.
fn seed_order(graph: &ReorderGraph, lo: usize, hi: usize) -> Vec<u32> {
    let mut seeds: Vec<u32> = (lo as u32..hi as u32).collect();
    seeds.sort_by(|&a, &b| {
        graph
            .in_neighbors(b)
            .len()
            .cmp(&graph.in_neighbors(a).len())
            .then(a.cmp(&b))
    });
    seeds
}

/// Pack every node of `graph` into groups of at most `omega`, using
/// `threads` workers that each seed from a disjoint id slice. Groups come
/// back whole, in placement order, so the layout can keep each one inside a
/// single sector.
///
/// With one thread the grouping is deterministic. With more, which worker
/// wins a contested node depends on timing, but every node is still placed
/// exactly once.
pub fn greedy_ordering(graph: &ReorderGraph, omega: usize, threads: usize) -> Vec<Vec<u32>> {
    let n = graph.len();
    if n == 0 {
        return Vec::new();
    }
    let deleted = AtomicBitSet::new(n);
    let threads = threads.clamp(1, n);
    let span = n.div_ceil(threads);

    let partials: Vec<Vec<Vec<u32>>> = (0..threads)
        .into_par_iter()
        .map(|w| {
            let (lo, hi) = ((w * span).min(n), ((w + 1) * span).min(n));
            let mut groups = Vec::new();
            for seed in seed_order(graph, lo, hi) {
                if deleted.get(seed as usize) {
                    continue;
                }
                let group = partition_packing(graph, &deleted, seed, omega);
                if !group.is_empty() {
                    groups.push(group);
                }
            }
            groups
        })
        .collect();

    partials.concat()
}
