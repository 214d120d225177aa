//! Locality-aware node permutation for the sector layout.
//!
//! Beam search reads a node's sector and then, very often, the sectors of its
//! neighbours. Placing frequently co-traversed nodes in the same sector turns
//! several random reads into one.
//!
//! ```text
//! identity:   [ 0 ][ 1 ][ 2 ][ 3 ][ 4 ][ 5 ]   one node per sector
//! reordered:  [ 0  3  4 ][ 1  2  - ][ 5  -  - ] groups of up to omega, padded
//! ```
//!
//! A group never straddles a sector: when it does not fit the slots left in
//! the current sector, those slots stay empty and the group starts the next
//! one.
//!
//! The packing is Gorder-like (Wei et al., 2016): a group is grown from a
//! seed by repeatedly claiming the unplaced node with the most edges into,
//! out of, or sharing in-neighbours with the group. Placement is tracked in
//! an [`AtomicBitSet`] so concurrent workers never place a node twice.
//!
//! Large graphs are reordered shard by shard: only one shard's induced
//! subgraph is held in memory, and the per-shard groups are laid out one
//! after another.

mod bitset;
mod packing;

pub use bitset::AtomicBitSet;
pub use packing::{greedy_ordering, partition_packing, ReorderGraph};

/// Marks an unused slot in `porder`.
pub const EMPTY_SLOT: u32 = u32::MAX;

use crate::error::{BuildError, Phase, Result};
use crate::io::{read_bin, read_idmap, write_bin, GraphReader};
use std::path::Path;
use tracing::{debug, info};

/// Placement of nodes into layout slots.
///
/// Slot `s` lives in data sector `s / nodes_per_sector`. Every node has
/// exactly one slot; slots may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    /// Slot -> node or [`EMPTY_SLOT`] (`porder`).
    order: Vec<u32>,
    /// Node -> slot (`lorder`).
    location: Vec<u32>,
}

impl Permutation {
    pub fn identity(n: usize) -> Self {
        let order: Vec<u32> = (0..n as u32).collect();
        Self {
            location: order.clone(),
            order,
        }
    }

    /// Validate `order` (slot -> node) as placing each of `[0, n)` exactly
    /// once, where `n` is the number of non-empty slots.
    pub fn from_order(order: Vec<u32>) -> Result<Self> {
        let n = order.iter().filter(|&&v| v != EMPTY_SLOT).count();
        let mut location = vec![u32::MAX; n];
        for (slot_id, &node) in order.iter().enumerate() {
            if node == EMPTY_SLOT {
                continue;
            }
            let slot = location.get_mut(node as usize).ok_or_else(|| {
                BuildError::InvalidPermutation(format!(
                    "slot {slot_id} holds node {node}, beyond {n} nodes"
                ))
            })?;
            if *slot != u32::MAX {
                return Err(BuildError::InvalidPermutation(format!(
                    "node {node} placed at both {} and {slot_id}",
                    *slot
                )));
            }
            *slot = slot_id as u32;
        }
        Ok(Self { order, location })
    }

    /// Lay `groups` out in order, `slots_per_sector` slots to a sector. A
    /// group that does not fit the rest of the current sector starts the
    /// next one.
    pub fn from_groups(groups: &[Vec<u32>], slots_per_sector: usize) -> Result<Self> {
        if slots_per_sector == 0 {
            return Err(BuildError::config(Phase::Reorder, "a sector must hold at least one slot"));
        }
        let mut order = Vec::with_capacity(groups.iter().map(Vec::len).sum());
        for group in groups {
            if group.len() > slots_per_sector {
                return Err(BuildError::InvalidPermutation(format!(
                    "group of {} nodes exceeds {slots_per_sector} slots per sector",
                    group.len()
                )));
            }
            let used = order.len() % slots_per_sector;
            if used + group.len() > slots_per_sector {
                order.resize(order.len() + slots_per_sector - used, EMPTY_SLOT);
            }
            order.extend_from_slice(group);
        }
        Self::from_order(order)
    }

    pub fn num_nodes(&self) -> usize {
        self.location.len()
    }

    /// Slots used, empty ones included.
    pub fn num_slots(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_empty()
    }

    /// Node placed at `slot`, if any.
    pub fn node_at(&self, slot: usize) -> Option<u32> {
        self.order.get(slot).copied().filter(|&v| v != EMPTY_SLOT)
    }

    /// Slot of `node`.
    pub fn position_of(&self, node: u32) -> u32 {
        self.location[node as usize]
    }

    pub fn order(&self) -> &[u32] {
        &self.order
    }

    pub fn location(&self) -> &[u32] {
        &self.location
    }

    /// Write `porder` (slot -> node) and `lorder` (node -> slot).
    pub fn save(&self, porder: &Path, lorder: &Path) -> Result<()> {
        write_bin(porder, Phase::Reorder, &self.order, self.num_slots(), 1)?;
        write_bin(lorder, Phase::Reorder, &self.location, self.num_nodes(), 1)
    }

    /// Read a `porder` file and validate it.
    pub fn load(porder: &Path) -> Result<Self> {
        let (order, header) = read_bin::<u32>(porder, Phase::Reorder)?;
        if header.dim != 1 {
            return Err(BuildError::corrupt(
                Phase::Reorder,
                porder,
                format!("porder must have dim 1, found {}", header.dim),
            ));
        }
        Self::from_order(order)
    }
}

/// Induced subgraph of `nodes` (ascending global ids) read from a merged
/// graph file. Local id `i` is `nodes[i]`; edges leaving the set are dropped.
pub fn load_partial_graph(graph: &Path, nodes: &[u32]) -> Result<ReorderGraph> {
    let mut reader = GraphReader::open(graph, Phase::Reorder)?;
    let mut out = Vec::with_capacity(nodes.len());
    let local_of = |g: u32| nodes.binary_search(&g).ok();

    for &target in nodes {
        while reader.next_id() < target {
            if !reader.skip_node()? {
                break;
            }
        }
        if reader.next_id() != target {
            return Err(BuildError::corrupt(
                Phase::Reorder,
                graph,
                format!("node {target} not present (ids must be ascending and in range)"),
            ));
        }
        let Some(neighbors) = reader.next_node()? else {
            return Err(BuildError::corrupt(
                Phase::Reorder,
                graph,
                format!("graph ends before node {target}"),
            ));
        };
        out.push(
            neighbors
                .iter()
                .filter_map(|&g| local_of(g).map(|l| l as u32))
                .collect(),
        );
    }
    Ok(ReorderGraph::from_out_edges(out))
}

/// Group one partial graph and map the groups back to global ids.
pub fn process_partial_graph(
    partial: &ReorderGraph,
    global_ids: &[u32],
    omega: usize,
    threads: usize,
) -> Vec<Vec<u32>> {
    greedy_ordering(partial, omega, threads)
        .into_iter()
        .map(|group| group.into_iter().map(|local| global_ids[local as usize]).collect())
        .collect()
}

/// Assign each node to the first shard whose id map lists it. Returns one
/// ascending node list per shard.
pub fn disjoint_parts_from_idmaps(
    idmaps: &[impl AsRef<Path>],
    num_nodes: usize,
) -> Result<Vec<Vec<u32>>> {
    let mut owner = vec![usize::MAX; num_nodes];
    let mut parts = Vec::with_capacity(idmaps.len());
    for (shard, path) in idmaps.iter().enumerate() {
        let path = path.as_ref();
        let mut part = Vec::new();
        for g in read_idmap(path, Phase::Reorder)? {
            let Some(slot) = owner.get_mut(g as usize) else {
                return Err(BuildError::corrupt(
                    Phase::Reorder,
                    path,
                    format!("id {g} beyond {num_nodes} nodes"),
                ));
            };
            if *slot == usize::MAX {
                *slot = shard;
                part.push(g);
            }
        }
        part.sort_unstable();
        parts.push(part);
    }
    if let Some(missing) = owner.iter().position(|&o| o == usize::MAX) {
        return Err(BuildError::InvalidPermutation(format!(
            "node {missing} belongs to no shard"
        )));
    }
    Ok(parts)
}

/// Count the nodes of a graph file.
fn count_nodes(graph: &Path) -> Result<usize> {
    let mut reader = GraphReader::open(graph, Phase::Reorder)?;
    while reader.skip_node()? {}
    Ok(reader.next_id() as usize)
}

/// Reorder a merged graph one part at a time.
///
/// `parts` must partition the graph's node ids. Groups of at most `omega`
/// nodes are laid out `slots_per_sector` to a sector without straddling a
/// boundary; the placement is validated before `porder` and `lorder` are
/// written.
pub fn reorder_merged_shards(
    graph: &Path,
    parts: &[Vec<u32>],
    omega: usize,
    slots_per_sector: usize,
    threads: usize,
    porder: &Path,
    lorder: &Path,
) -> Result<Permutation> {
    if omega == 0 {
        return Err(BuildError::config(Phase::Reorder, "omega must be at least 1"));
    }
    if omega > slots_per_sector {
        return Err(BuildError::config(
            Phase::Reorder,
            format!("omega {omega} exceeds the {slots_per_sector} records a sector holds"),
        ));
    }
    let num_nodes = count_nodes(graph)?;
    info!(
        num_nodes,
        parts = parts.len(),
        omega,
        slots_per_sector,
        threads,
        "reordering merged graph"
    );

    let mut groups = Vec::new();
    let mut placed = 0;
    for (i, part) in parts.iter().enumerate() {
        let partial = load_partial_graph(graph, part)?;
        let part_groups = process_partial_graph(&partial, part, omega, threads);
        debug!(part = i, nodes = part.len(), groups = part_groups.len(), "ordered part");
        placed += part_groups.iter().map(Vec::len).sum::<usize>();
        groups.extend(part_groups);
    }
    if placed != num_nodes {
        return Err(BuildError::InvalidPermutation(format!(
            "parts cover {placed} positions for {num_nodes} nodes"
        )));
    }

    let permutation = Permutation::from_groups(&groups, slots_per_sector)?;
    info!(
        groups = groups.len(),
        slots = permutation.num_slots(),
        empty_slots = permutation.num_slots() - num_nodes,
        "placement ready"
    );
    permutation.save(porder, lorder)?;
    Ok(permutation)
}
