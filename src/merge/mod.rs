//! Shard graph merge.
//!
//! Every shard graph uses local ids; its id map translates them to global
//! ids. Because points are replicated into several shards, one global node
//! receives edges from every shard that holds it, so the merge is a
//! multi-writer accumulation keyed by global id.
//!
//! # Concurrency
//!
//! ```text
//!  shard 0 reader ─┐             ┌─► worker 0  owns [0, span)
//!  shard 1 reader ─┼─ channels ──┼─► worker 1  owns [span, 2·span)
//!  shard 2 reader ─┘             └─► worker 2  owns [2·span, N)
//! ```
//!
//! Readers translate ids and route each adjacency list to the worker that
//! owns the source node. A worker is the only writer of its range, so no
//! locks guard adjacency lists. After all readers finish, each worker
//! deduplicates and prunes its own lists.
//!
//! # Memory
//!
//! Only one window of global ids is accumulated at a time. Windows are sized
//! from how many shards hold each node, so the worst-case adjacency of a
//! window stays within the pass budget. Id maps are ascending, so every
//! shard reader simply continues into the next window.
//!
//! # Pruning
//!
//! Lists longer than `max_degree` keep the `max_degree` edges with the lowest
//! [`EdgeRanker`] priority (ties to the lower id). Edges are dropped, never
//! nodes. Lists within the bound come out sorted by id.

mod ranker;

pub use ranker::{prune_to_degree, DistanceRanker, EdgeRanker, IdOrderRanker};

use crate::error::{BuildError, Phase, Result};
use crate::io::graph::Neighbors;
use crate::io::{commit_together, read_idmap, BinWriter, GraphReader, GraphWriter};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Adjacency lists routed to one worker: `(global source, global targets)`.
type Batch = Vec<(u32, Neighbors)>;

/// Lists buffered per worker before a channel send.
const BATCH_LEN: usize = 1024;
/// Batches in flight per worker.
const CHANNEL_DEPTH: usize = 16;
/// Accumulated adjacency held at once by [`merge_shards`].
pub const DEFAULT_PASS_BYTES: u64 = 1 << 30;
/// Per-node bookkeeping counted against the pass budget.
const LIST_OVERHEAD_BYTES: u64 = 24;

/// One shard's graph file and id map.
#[derive(Debug, Clone)]
pub struct ShardInput {
    pub graph: PathBuf,
    pub idmap: PathBuf,
}

/// Summary of a completed merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub num_nodes: usize,
    /// Shard medoids in global ids, deduplicated, in shard order.
    pub medoids: Vec<u32>,
    /// Nodes whose accumulated degree exceeded the bound.
    pub pruned_nodes: usize,
    /// Largest accumulated degree before pruning.
    pub max_accumulated_degree: usize,
    /// Id windows the merge was split into.
    pub passes: usize,
}

struct WorkerOutput {
    adjacency: Vec<Vec<u32>>,
    pruned: usize,
    max_degree_seen: usize,
}

/// [`merge_shards_within`] with a [`DEFAULT_PASS_BYTES`] budget.
pub fn merge_shards<R: EdgeRanker + ?Sized>(
    shards: &[ShardInput],
    output: &Path,
    medoids_out: &Path,
    max_degree: u32,
    ranker: &R,
    workers: usize,
) -> Result<MergeOutcome> {
    merge_shards_within(shards, output, medoids_out, max_degree, ranker, workers, DEFAULT_PASS_BYTES)
}

/// Merge shard graphs into one global graph at `output` and write the
/// medoid set to `medoids_out`.
///
/// The global id space is merged in ascending windows sized so that the
/// adjacency accumulated for one window stays within `pass_bytes`. Each
/// window is written out before the next is read; shard files are still
/// read front to back exactly once.
///
/// All shard inputs are validated before any output is written; a missing or
/// corrupt shard aborts the whole merge. The graph and the medoid file are
/// published together.
pub fn merge_shards_within<R: EdgeRanker + ?Sized>(
    shards: &[ShardInput],
    output: &Path,
    medoids_out: &Path,
    max_degree: u32,
    ranker: &R,
    workers: usize,
    pass_bytes: u64,
) -> Result<MergeOutcome> {
    if max_degree == 0 {
        return Err(BuildError::config(Phase::Merge, "max_degree must be at least 1"));
    }
    if shards.is_empty() {
        return Err(BuildError::config(Phase::Merge, "no shards to merge"));
    }

    let mut maps = Vec::with_capacity(shards.len());
    let mut readers = Vec::with_capacity(shards.len());
    for shard in shards {
        let ids = read_idmap(&shard.idmap, Phase::Merge)?;
        if let Some(w) = ids.windows(2).find(|w| w[0] >= w[1]) {
            return Err(BuildError::corrupt(
                Phase::Merge,
                &shard.idmap,
                format!("id map not strictly ascending at {} -> {}", w[0], w[1]),
            ));
        }
        readers.push(GraphReader::open(&shard.graph, Phase::Merge)?);
        maps.push(ids);
    }

    let num_nodes = maps
        .iter()
        .filter_map(|ids| ids.last())
        .max()
        .map_or(0, |&m| m as usize + 1);
    let mut copies = vec![0u8; num_nodes];
    for ids in &maps {
        for &g in ids {
            copies[g as usize] = copies[g as usize].saturating_add(1);
        }
    }
    if let Some(missing) = copies.iter().position(|&c| c == 0) {
        return Err(BuildError::corrupt(
            Phase::Merge,
            &shards[0].idmap,
            format!("global id {missing} appears in no shard id map"),
        ));
    }

    let mut medoids = Vec::new();
    for ((shard, reader), ids) in shards.iter().zip(&readers).zip(&maps) {
        if ids.is_empty() {
            continue;
        }
        let start = reader.header().start as usize;
        let Some(&global) = ids.get(start) else {
            return Err(BuildError::corrupt(
                Phase::Merge,
                &shard.graph,
                format!("start node {start} beyond {} shard nodes", ids.len()),
            ));
        };
        if !medoids.contains(&global) {
            medoids.push(global);
        }
    }
    if medoids.is_empty() && num_nodes > 0 {
        warn!("no shard reported a medoid, using node 0");
        medoids.push(0);
    }

    let shard_degree = readers
        .iter()
        .map(|r| r.header().max_degree as u64)
        .max()
        .unwrap_or(0);
    let passes = plan_passes(&copies, 4 * shard_degree, pass_bytes);
    drop(copies);
    info!(
        shards = shards.len(),
        num_nodes,
        workers,
        max_degree,
        passes = passes.len(),
        "merging shard graphs"
    );

    let mut writer = GraphWriter::create(
        output,
        Phase::Merge,
        max_degree,
        medoids.first().copied().unwrap_or(0),
    )?;
    let mut pruned_nodes = 0;
    let mut max_accumulated_degree = 0;
    for (pass, window) in passes.iter().enumerate() {
        let parts = merge_pass(&mut readers, &maps, window.clone(), max_degree as usize, ranker, workers)?;
        for part in &parts {
            pruned_nodes += part.pruned;
            max_accumulated_degree = max_accumulated_degree.max(part.max_degree_seen);
            for neighbors in &part.adjacency {
                writer.write_node(neighbors)?;
            }
        }
        debug!(pass, lo = window.start, hi = window.end, "merge pass written");
    }
    for ((shard, reader), ids) in shards.iter().zip(&mut readers).zip(&maps) {
        if reader.next_node()?.is_some() {
            return Err(BuildError::corrupt(
                Phase::Merge,
                &shard.graph,
                format!("graph has more nodes than its {} ids", ids.len()),
            ));
        }
    }

    let (_, graph_stage) = writer.finish_staged()?;
    let mut medoid_writer = BinWriter::<u32>::create(medoids_out, Phase::Merge, 1)?;
    medoid_writer.write_rows(&medoids)?;
    let (_, medoid_stage) = medoid_writer.finish_staged()?;
    commit_together(vec![graph_stage, medoid_stage])?;

    info!(
        num_nodes,
        pruned_nodes,
        max_accumulated_degree,
        medoids = medoids.len(),
        output = %output.display(),
        "merge complete"
    );
    Ok(MergeOutcome {
        num_nodes,
        medoids,
        pruned_nodes,
        max_accumulated_degree,
        passes: passes.len(),
    })
}

/// Split `[0, copies.len())` into ascending windows whose worst-case
/// accumulated adjacency fits `pass_bytes`. A window always holds at least
/// one node.
fn plan_passes(copies: &[u8], bytes_per_copy: u64, pass_bytes: u64) -> Vec<Range<usize>> {
    let mut passes = Vec::new();
    let mut lo = 0;
    let mut used = 0u64;
    for (g, &c) in copies.iter().enumerate() {
        let cost = LIST_OVERHEAD_BYTES + c as u64 * bytes_per_copy;
        if g > lo && used + cost > pass_bytes {
            passes.push(lo..g);
            lo = g;
            used = 0;
        }
        used += cost;
    }
    if lo < copies.len() {
        passes.push(lo..copies.len());
    }
    passes
}

/// Merge the lists of `window` from every shard.
///
/// Readers continue from where the previous window left them; workers own
/// disjoint sub-ranges of the window.
fn merge_pass<R: EdgeRanker + ?Sized>(
    readers: &mut [GraphReader],
    maps: &[Vec<u32>],
    window: Range<usize>,
    max_degree: usize,
    ranker: &R,
    workers: usize,
) -> Result<Vec<WorkerOutput>> {
    let workers = workers.clamp(1, window.len().max(1));
    let span = window.len().div_ceil(workers).max(1);
    let (senders, receivers): (Vec<Sender<Batch>>, Vec<Receiver<Batch>>) =
        (0..workers).map(|_| bounded(CHANNEL_DEPTH)).unzip();

    std::thread::scope(|scope| -> Result<Vec<WorkerOutput>> {
        let worker_handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(w, rx)| {
                let lo = (window.start + w * span).min(window.end);
                let hi = (window.start + (w + 1) * span).min(window.end);
                scope.spawn(move || accumulate(rx, lo, hi, max_degree, ranker))
            })
            .collect();

        let reader_handles: Vec<_> = readers
            .iter_mut()
            .zip(maps)
            .enumerate()
            .map(|(s, (reader, ids))| {
                let senders = senders.clone();
                let window = window.clone();
                scope.spawn(move || route_shard(s, reader, ids, &senders, window, span))
            })
            .collect();
        drop(senders);

        let mut failure = None;
        for handle in reader_handles {
            match handle.join() {
                Ok(Ok(edges)) => debug!(edges, "shard window routed"),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        let mut parts = Vec::with_capacity(workers);
        for handle in worker_handles {
            match handle.join() {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(parts),
        }
    })
}

/// Stream one shard's nodes that fall in `window`, translate to global ids,
/// and route to owning workers. Returns the number of edges routed.
fn route_shard(
    shard: usize,
    reader: &mut GraphReader,
    ids: &[u32],
    senders: &[Sender<Batch>],
    window: Range<usize>,
    span: usize,
) -> Result<u64> {
    let path = reader.path().to_path_buf();
    let mut pending: Vec<Batch> = vec![Vec::new(); senders.len()];
    let mut edges = 0u64;

    let send = |worker: usize, batch: Batch| -> Result<()> {
        senders[worker].send(batch).map_err(|_| {
            BuildError::config(Phase::Merge, format!("merge worker {worker} exited early"))
        })
    };

    loop {
        let local = reader.next_id();
        let Some(&src) = ids.get(local as usize) else {
            break;
        };
        if src as usize >= window.end {
            break;
        }
        let Some(local_neighbors) = reader.next_node()? else {
            return Err(BuildError::corrupt(
                Phase::Merge,
                &path,
                format!(
                    "shard {shard} graph has {local} nodes but its id map has {}",
                    ids.len()
                ),
            ));
        };

        let mut translated = Neighbors::new();
        for &l in &local_neighbors {
            let Some(&g) = ids.get(l as usize) else {
                return Err(BuildError::corrupt(
                    Phase::Merge,
                    &path,
                    format!(
                        "shard {shard} node {local} points to local id {l} beyond {} nodes",
                        ids.len()
                    ),
                ));
            };
            if g != src {
                translated.push(g);
            }
        }
        edges += translated.len() as u64;

        let worker = (src as usize - window.start) / span;
        pending[worker].push((src, translated));
        if pending[worker].len() >= BATCH_LEN {
            send(worker, std::mem::take(&mut pending[worker]))?;
        }
    }

    for (worker, batch) in pending.into_iter().enumerate() {
        if !batch.is_empty() {
            send(worker, batch)?;
        }
    }
    Ok(edges)
}

/// Collect every list routed to `[lo, hi)`, then dedupe and prune.
fn accumulate<R: EdgeRanker + ?Sized>(
    rx: Receiver<Batch>,
    lo: usize,
    hi: usize,
    max_degree: usize,
    ranker: &R,
) -> Result<WorkerOutput> {
    let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); hi - lo];
    for batch in rx {
        for (src, neighbors) in batch {
            adjacency[src as usize - lo].extend_from_slice(&neighbors);
        }
    }

    let mut pruned = 0;
    let mut max_degree_seen = 0;
    for (offset, list) in adjacency.iter_mut().enumerate() {
        list.sort_unstable();
        list.dedup();
        max_degree_seen = max_degree_seen.max(list.len());
        if list.len() > max_degree {
            pruned += 1;
            let node = (lo + offset) as u32;
            *list = prune_to_degree(node, std::mem::take(list), max_degree, ranker)?;
        }
    }
    Ok(WorkerOutput {
        adjacency,
        pruned,
        max_degree_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{load_graph, read_idmap, write_bin};

    fn write_shard(dir: &Path, name: &str, ids: &[u32], adj: &[&[u32]], start: u32) -> ShardInput {
        let graph = dir.join(format!("{name}_mem.index"));
        let idmap = dir.join(format!("{name}_ids.bin"));
        write_bin(&idmap, Phase::Merge, ids, ids.len(), 1).unwrap();
        let max = adj.iter().map(|a| a.len()).max().unwrap_or(0).max(1) as u32;
        let mut w = GraphWriter::create(&graph, Phase::Merge, max, start).unwrap();
        for a in adj {
            w.write_node(a).unwrap();
        }
        w.finish().unwrap();
        ShardInput { graph, idmap }
    }

    #[test]
    fn disjoint_shards_merge_to_their_union() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_shard(dir.path(), "a", &[0, 1, 2], &[&[1, 2], &[0], &[1]], 1);
        let b = write_shard(dir.path(), "b", &[3, 4, 5], &[&[2], &[0, 2], &[1]], 0);
        let out = dir.path().join("merged.index");
        let med = dir.path().join("medoids.bin");

        for workers in [1, 2, 4] {
            let outcome = merge_shards(&[a.clone(), b.clone()], &out, &med, 8, &IdOrderRanker, workers)
                .unwrap();
            assert_eq!(outcome.num_nodes, 6);
            assert_eq!(outcome.pruned_nodes, 0);
            assert_eq!(outcome.medoids, vec![1, 3]);

            let (header, adj) = load_graph(&out, Phase::Merge, Some(6)).unwrap();
            assert_eq!(header.start, 1);
            assert_eq!(
                adj,
                vec![vec![1, 2], vec![0], vec![1], vec![5], vec![3, 5], vec![4]]
            );
            assert_eq!(read_idmap(&med, Phase::Merge).unwrap(), vec![1, 3]);
        }
    }

    #[test]
    fn overlapping_node_accumulates_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        // Global node 1 lives in both shards.
        let a = write_shard(dir.path(), "a", &[0, 1, 2], &[&[1], &[0, 2, 1], &[1]], 0);
        let b = write_shard(dir.path(), "b", &[1, 3, 4], &[&[1, 2, 0], &[0], &[0]], 0);
        let out = dir.path().join("merged.index");
        let med = dir.path().join("medoids.bin");

        let outcome = merge_shards(&[a, b], &out, &med, 3, &IdOrderRanker, 2).unwrap();
        let (_, adj) = load_graph(&out, Phase::Merge, Some(5)).unwrap();
        // 0, 2 from a (self-loop dropped); 3, 4 from b; duplicate-free.
        assert_eq!(adj[1], vec![0, 2, 3]);
        assert_eq!(outcome.pruned_nodes, 1);
        assert_eq!(outcome.max_accumulated_degree, 4);
        assert_eq!(outcome.medoids, vec![0, 1]);
    }

    #[test]
    fn corrupt_shard_aborts_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_shard(dir.path(), "a", &[0, 1], &[&[1], &[0]], 0);
        let b = write_shard(dir.path(), "b", &[2, 3], &[&[1], &[0]], 0);
        let bytes = std::fs::read(&b.graph).unwrap();
        std::fs::write(&b.graph, &bytes[..bytes.len() - 3]).unwrap();

        let out = dir.path().join("merged.index");
        let med = dir.path().join("medoids.bin");
        let err = merge_shards(&[a, b], &out, &med, 4, &IdOrderRanker, 2).unwrap_err();
        assert_eq!(err.phase(), Phase::Merge);
        assert!(!out.exists());
        assert!(!med.exists());
    }

    #[test]
    fn dangling_local_id_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_shard(dir.path(), "a", &[0, 1], &[&[1], &[0]], 0);
        // Local id 2 names nothing in a two-point shard.
        let graph = dir.path().join("bad_mem.index");
        let mut w = GraphWriter::create(&graph, Phase::Merge, 2, 0).unwrap();
        w.write_node(&[2]).unwrap();
        w.write_node(&[0]).unwrap();
        w.finish().unwrap();
        let idmap = dir.path().join("bad_ids.bin");
        write_bin(&idmap, Phase::Merge, &[2u32, 3], 2, 1).unwrap();

        let out = dir.path().join("merged.index");
        let med = dir.path().join("medoids.bin");
        let err = merge_shards(&[a, ShardInput { graph, idmap }], &out, &med, 4, &IdOrderRanker, 3)
            .unwrap_err();
        assert!(matches!(err, BuildError::Corrupt { ref reason, .. } if reason.contains("local id 2")));
        assert!(!out.exists());
    }

    #[test]
    fn passes_respect_the_budget() {
        // 24 bytes overhead + 8 bytes per copy.
        let copies = [1u8, 2, 1, 1, 3, 1];
        let passes = plan_passes(&copies, 8, 72);
        assert_eq!(passes, vec![0..2, 2..4, 4..6]);
        assert_eq!(plan_passes(&copies, 8, u64::MAX), vec![0..6]);
        // A node larger than the budget still gets a window of its own.
        assert_eq!(plan_passes(&copies, 8, 1).len(), 6);
        assert!(plan_passes(&[], 8, 100).is_empty());
    }

    #[test]
    fn windowed_merge_matches_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_shard(dir.path(), "a", &[0, 1, 2, 4], &[&[1, 3], &[0, 2, 1], &[1], &[0, 2]], 0);
        let b = write_shard(dir.path(), "b", &[1, 3, 4, 5], &[&[1, 2, 0], &[0, 3], &[0], &[2, 1]], 2);
        let shards = [a, b];

        let whole = dir.path().join("whole.index");
        let whole_med = dir.path().join("whole_medoids.bin");
        let one = merge_shards(&shards, &whole, &whole_med, 3, &IdOrderRanker, 2).unwrap();
        assert_eq!(one.passes, 1);

        for workers in [1, 3] {
            let out = dir.path().join("windowed.index");
            let med = dir.path().join("windowed_medoids.bin");
            let many =
                merge_shards_within(&shards, &out, &med, 3, &IdOrderRanker, workers, 1).unwrap();
            assert_eq!(many.passes, 6);
            assert_eq!(many.pruned_nodes, one.pruned_nodes);
            assert_eq!(many.max_accumulated_degree, one.max_accumulated_degree);
            assert_eq!(
                load_graph(&out, Phase::Merge, Some(6)).unwrap(),
                load_graph(&whole, Phase::Merge, Some(6)).unwrap()
            );
            assert_eq!(read_idmap(&med, Phase::Merge).unwrap(), vec![0, 4]);
        }
    }

    #[test]
    fn extra_shard_nodes_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        // Three adjacency lists for a two-id map.
        let a = write_shard(dir.path(), "a", &[0, 1], &[&[1], &[0], &[0]], 0);
        let out = dir.path().join("merged.index");
        let med = dir.path().join("medoids.bin");
        let err = merge_shards_within(&[a], &out, &med, 2, &IdOrderRanker, 2, 1).unwrap_err();
        assert!(matches!(err, BuildError::Corrupt { phase: Phase::Merge, .. }));
        assert!(!out.exists());
        assert!(!med.exists());
    }

    #[test]
    fn missing_global_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_shard(dir.path(), "a", &[0, 2], &[&[1], &[0]], 0);
        let out = dir.path().join("merged.index");
        let med = dir.path().join("medoids.bin");
        assert!(matches!(
            merge_shards(&[a], &out, &med, 4, &IdOrderRanker, 1),
            Err(BuildError::Corrupt { .. })
        ));
    }
}
