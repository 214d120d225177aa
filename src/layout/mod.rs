//! Sector-packed disk index.
//!
//! ```text
//! sector 0        header (shape, medoids)
//! sector 1..=D    node records, `nodes_per_sector` per sector
//! sector D+1..    node -> position table (reordered layouts only)
//! ```
//!
//! A node record is
//!
//! ```text
//! u32 id | payload | u32 degree | max_degree × u32 neighbours (unused = 0)
//! ```
//!
//! where the payload is either the full `f32` vector or its PQ codes.
//! Records never straddle a sector boundary. The default layout stores one
//! node per sector in id order; a reordered layout packs as many records as
//! fit into each sector, slot by slot in permutation order. Empty slots are
//! zeroed and carry the id [`EMPTY_SLOT`].
//!
//! Re-rank vectors, when requested, go to a separate bin file and never
//! into the sector bytes. The index and the re-rank file are published
//! together.

mod header;
mod reader;

pub use header::{LayoutHeader, PayloadKind, HEADER_FIXED_LEN, LAYOUT_MAGIC, LAYOUT_VERSION};
pub use reader::{DiskIndexReader, NodePayload, NodeRecord};

use crate::error::{BuildError, IoContext, Phase, Result};
use crate::io::graph::{Neighbors, GRAPH_HEADER_LEN};
use crate::io::{commit_together, read_bin, BinReader, BinWriter, GraphReader, Staged, VectorStore};
use crate::reorder::{Permutation, EMPTY_SLOT};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Progress is logged every this many sectors.
const LOG_EVERY_SECTORS: u64 = 100_000;

/// Inputs of one layout build.
#[derive(Debug, Clone, Copy)]
pub struct LayoutSpec<'a> {
    /// Merged graph over global ids.
    pub graph: &'a Path,
    /// Full-precision vectors (`f32` bin), one row per node.
    pub vectors: &'a Path,
    /// PQ codes (`u8` bin); when set, records carry codes instead of vectors.
    pub pq_codes: Option<&'a Path>,
    /// Entry points; the first is the primary medoid.
    pub medoids: &'a [u32],
    pub sector_size: usize,
    /// Placement order; packs several records per sector when set.
    pub permutation: Option<&'a Permutation>,
    /// Where to write full-precision re-rank vectors, if wanted.
    pub rerank_vectors: Option<&'a Path>,
}

/// Random access over a graph file through a memory map.
struct MappedGraph {
    mmap: Mmap,
    offsets: Vec<u64>,
}

impl MappedGraph {
    fn open(path: &Path, max_degree: u32) -> Result<Self> {
        // Header and sizes were checked by GraphReader::open.
        let file = File::open(path).at(Phase::Layout, path)?;
        // SAFETY: read-only map of a finished graph file that no phase
        // rewrites while the layout is built.
        let mmap = unsafe { Mmap::map(&file) }.at(Phase::Layout, path)?;

        let mut offsets = Vec::new();
        let mut at = GRAPH_HEADER_LEN;
        let len = mmap.len() as u64;
        while at < len {
            if at + 4 > len {
                return Err(BuildError::corrupt(Phase::Layout, path, "truncated degree"));
            }
            let degree = LittleEndian::read_u32(&mmap[at as usize..at as usize + 4]);
            if degree > max_degree || at + 4 + 4 * degree as u64 > len {
                return Err(BuildError::corrupt(
                    Phase::Layout,
                    path,
                    format!("node {} has bad degree {degree}", offsets.len()),
                ));
            }
            offsets.push(at);
            at += 4 + 4 * degree as u64;
        }
        Ok(Self { mmap, offsets })
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn neighbors(&self, node: u32) -> Neighbors {
        let at = self.offsets[node as usize] as usize;
        let degree = LittleEndian::read_u32(&self.mmap[at..at + 4]) as usize;
        let mut out: Neighbors = smallvec::SmallVec::from_elem(0, degree);
        LittleEndian::read_u32_into(&self.mmap[at + 4..at + 4 + 4 * degree], &mut out);
        out
    }
}

enum GraphSource {
    /// Identity order: nodes are consumed front to back.
    Stream(GraphReader),
    Mapped(MappedGraph),
}

impl GraphSource {
    fn neighbors(&mut self, node: u32, path: &Path) -> Result<Neighbors> {
        match self {
            GraphSource::Mapped(g) => Ok(g.neighbors(node)),
            GraphSource::Stream(r) => {
                debug_assert_eq!(r.next_id(), node);
                r.next_node()?.ok_or_else(|| {
                    BuildError::corrupt(Phase::Layout, path, format!("graph ends before node {node}"))
                })
            }
        }
    }
}

/// Encode one record into `out` (`node_len` bytes, pre-zeroed).
fn encode_record(out: &mut [u8], id: u32, payload: &[u8], neighbors: &[u32]) {
    LittleEndian::write_u32(&mut out[0..4], id);
    out[4..4 + payload.len()].copy_from_slice(payload);
    let at = 4 + payload.len();
    LittleEndian::write_u32(&mut out[at..at + 4], neighbors.len() as u32);
    for (i, &n) in neighbors.iter().enumerate() {
        let slot = at + 4 + 4 * i;
        LittleEndian::write_u32(&mut out[slot..slot + 4], n);
    }
}

/// Serialize graph, payloads and medoids into `output`.
///
/// All shape checks (record fits a sector, node counts agree, permutation
/// covers every node, medoids are valid) happen before the first byte is
/// written. The file is staged and published only when complete.
pub fn create_disk_layout(spec: &LayoutSpec<'_>, output: &Path) -> Result<LayoutHeader> {
    let reader = GraphReader::open(spec.graph, Phase::Layout)?;
    let max_degree = reader.header().max_degree;
    let vectors = VectorStore::open(spec.vectors, Phase::Layout)?;
    let num_nodes = vectors.npts();
    let dim = vectors.dim();

    let (codes, pq_chunks) = match spec.pq_codes {
        Some(path) => {
            let (codes, header) = read_bin::<u8>(path, Phase::Layout)?;
            if header.npts != num_nodes {
                return Err(BuildError::corrupt(
                    Phase::Layout,
                    path,
                    format!("{} PQ rows for {num_nodes} vectors", header.npts),
                ));
            }
            (Some(codes), header.dim)
        }
        None => (None, 0),
    };
    let payload = if codes.is_some() {
        PayloadKind::Pq
    } else {
        PayloadKind::Full
    };
    let payload_len = match payload {
        PayloadKind::Full => dim * 4,
        PayloadKind::Pq => pq_chunks,
    };

    let node_len = 4 + payload_len + 4 + 4 * max_degree as usize;
    if node_len > spec.sector_size {
        let first = spec.permutation.and_then(|p| p.node_at(0)).unwrap_or(0);
        return Err(BuildError::Capacity {
            node: first,
            record_len: node_len,
            sector_size: spec.sector_size,
        });
    }
    let nodes_per_sector = if spec.permutation.is_some() {
        spec.sector_size / node_len
    } else {
        1
    };

    if let Some(p) = spec.permutation {
        if p.num_nodes() != num_nodes {
            return Err(BuildError::InvalidPermutation(format!(
                "permutation places {} nodes, vectors hold {num_nodes}",
                p.num_nodes()
            )));
        }
    }
    if num_nodes > 0 && spec.medoids.is_empty() {
        return Err(BuildError::config(Phase::Layout, "medoid set is empty"));
    }
    if let Some(&bad) = spec.medoids.iter().find(|&&m| m as usize >= num_nodes) {
        return Err(BuildError::config(
            Phase::Layout,
            format!("medoid {bad} is not one of {num_nodes} nodes"),
        ));
    }
    if spec.medoids.len() > LayoutHeader::max_medoids(spec.sector_size) {
        return Err(BuildError::config(
            Phase::Layout,
            format!(
                "{} medoids do not fit a {}-byte header sector",
                spec.medoids.len(),
                spec.sector_size
            ),
        ));
    }

    let mut graph = match spec.permutation {
        Some(_) => {
            let mapped = MappedGraph::open(spec.graph, max_degree)?;
            if mapped.len() != num_nodes {
                return Err(BuildError::corrupt(
                    Phase::Layout,
                    spec.graph,
                    format!("graph has {} nodes, vectors {num_nodes}", mapped.len()),
                ));
            }
            GraphSource::Mapped(mapped)
        }
        None => GraphSource::Stream(reader),
    };

    let num_slots = spec.permutation.map_or(num_nodes, Permutation::num_slots);
    let num_data_sectors = (num_slots as u64).div_ceil(nodes_per_sector as u64);
    let reordered = spec.permutation.is_some();
    let header = LayoutHeader {
        num_nodes: num_nodes as u64,
        dim: dim as u32,
        max_degree,
        sector_size: spec.sector_size as u32,
        node_len: node_len as u32,
        nodes_per_sector: nodes_per_sector as u32,
        payload,
        num_data_sectors,
        pq_chunks: pq_chunks as u32,
        reordered,
        location_table_sector: if reordered { 1 + num_data_sectors } else { 0 },
        medoids: spec.medoids.to_vec(),
    };
    info!(
        num_nodes,
        dim,
        max_degree,
        node_len,
        nodes_per_sector,
        sector_size = spec.sector_size,
        ?payload,
        reordered,
        "writing disk layout"
    );

    let (stage, file) = Staged::create(output, Phase::Layout)?;
    let mut writer = BufWriter::with_capacity(1 << 20, file);
    writer.write_all(&header.to_sector()).at(Phase::Layout, output)?;

    let mut sector = vec![0u8; spec.sector_size];
    let mut vector = vec![0.0f32; dim];
    let mut payload_bytes = vec![0u8; payload_len];
    for s in 0..num_data_sectors {
        sector.fill(0);
        for slot in 0..nodes_per_sector {
            let position = s as usize * nodes_per_sector + slot;
            let at = slot * node_len;
            let placed = match spec.permutation {
                _ if position >= num_slots => None,
                None => Some(position as u32),
                Some(p) => p.node_at(position),
            };
            let Some(node) = placed else {
                LittleEndian::write_u32(&mut sector[at..at + 4], EMPTY_SLOT);
                continue;
            };

            let neighbors = graph.neighbors(node, spec.graph)?;
            if let Some(&bad) = neighbors.iter().find(|&&v| v as usize >= num_nodes) {
                return Err(BuildError::corrupt(
                    Phase::Layout,
                    spec.graph,
                    format!("node {node} points to {bad}, beyond {num_nodes} nodes"),
                ));
            }
            match &codes {
                Some(codes) => payload_bytes.copy_from_slice(
                    &codes[node as usize * pq_chunks..(node as usize + 1) * pq_chunks],
                ),
                None => {
                    vectors.read_into(node as usize, &mut vector);
                    LittleEndian::write_f32_into(&vector, &mut payload_bytes);
                }
            }
            encode_record(&mut sector[at..at + node_len], node, &payload_bytes, &neighbors);
        }
        writer.write_all(&sector).at(Phase::Layout, output)?;

        if (s + 1) % LOG_EVERY_SECTORS == 0 {
            info!(sectors = s + 1, total = num_data_sectors, "sectors written");
        }
    }

    if let GraphSource::Stream(reader) = &mut graph {
        if reader.next_node()?.is_some() {
            return Err(BuildError::corrupt(
                Phase::Layout,
                spec.graph,
                format!("graph has more nodes than the {num_nodes} vectors"),
            ));
        }
    }

    if let Some(p) = spec.permutation {
        let table_len = header.location_table_sectors() as usize * spec.sector_size;
        let mut table = vec![0u8; table_len];
        LittleEndian::write_u32_into(p.location(), &mut table[..num_nodes * 4]);
        writer.write_all(&table).at(Phase::Layout, output)?;
    }

    writer.flush().at(Phase::Layout, output)?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .at(Phase::Layout, output)?;
    file.sync_all().at(Phase::Layout, output)?;
    drop(file);

    let mut stages = Vec::with_capacity(2);
    if let Some(rerank) = spec.rerank_vectors {
        stages.push(copy_vectors(spec.vectors, rerank)?);
    }
    stages.push(stage);
    commit_together(stages)?;
    info!(output = %output.display(), bytes = header.file_len(), "disk layout complete");
    Ok(header)
}

/// Copy the full-precision vectors to the re-rank file, unpublished.
fn copy_vectors(from: &Path, to: &Path) -> Result<Staged> {
    let mut reader = BinReader::<f32>::open(from, Phase::Layout)?;
    let mut writer = BinWriter::<f32>::create(to, Phase::Layout, reader.header().dim)?;
    loop {
        let block = reader.read_block(65_536)?;
        if block.is_empty() {
            break;
        }
        writer.write_rows(&block)?;
    }
    let (_, stage) = writer.finish_staged()?;
    Ok(stage)
}
