//! Read-back of a finished disk index.

use super::header::{LayoutHeader, PayloadKind};
use crate::error::{BuildError, IoContext, Phase, Result};
use crate::reorder::EMPTY_SLOT;
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum NodePayload {
    Full(Vec<f32>),
    Pq(Vec<u8>),
}

/// One decoded node record.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: u32,
    pub payload: NodePayload,
    pub neighbors: Vec<u32>,
}

/// Memory-mapped reader over a disk index file.
pub struct DiskIndexReader {
    mmap: Mmap,
    header: LayoutHeader,
    path: PathBuf,
}

impl DiskIndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).at(Phase::Layout, path)?;
        // SAFETY: read-only map of a published (renamed) index file.
        let mmap = unsafe { Mmap::map(&file) }.at(Phase::Layout, path)?;
        let header = LayoutHeader::parse(&mmap, path)?;
        if mmap.len() as u64 != header.file_len() {
            return Err(BuildError::corrupt(
                Phase::Layout,
                path,
                format!(
                    "header implies {} bytes but file has {}",
                    header.file_len(),
                    mmap.len()
                ),
            ));
        }
        Ok(Self {
            mmap,
            header,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &LayoutHeader {
        &self.header
    }

    pub fn num_nodes(&self) -> u64 {
        self.header.num_nodes
    }

    /// Raw bytes of sector `sector`.
    pub fn sector(&self, sector: u64) -> Result<&[u8]> {
        let size = self.header.sector_size as u64;
        let start = sector * size;
        if start + size > self.mmap.len() as u64 {
            return Err(BuildError::corrupt(
                Phase::Layout,
                &self.path,
                format!("sector {sector} beyond end of file"),
            ));
        }
        Ok(&self.mmap[start as usize..(start + size) as usize])
    }

    /// Layout position of `node`.
    pub fn position_of(&self, node: u32) -> Result<u64> {
        if node as u64 >= self.header.num_nodes {
            return Err(BuildError::corrupt(
                Phase::Layout,
                &self.path,
                format!("node {node} beyond {} nodes", self.header.num_nodes),
            ));
        }
        if !self.header.reordered {
            return Ok(node as u64);
        }
        let at = (self.header.location_table_sector * self.header.sector_size as u64
            + node as u64 * 4) as usize;
        Ok(LittleEndian::read_u32(&self.mmap[at..at + 4]) as u64)
    }

    /// Sector holding the record at `position`.
    pub fn sector_of_position(&self, position: u64) -> u64 {
        1 + position / self.header.nodes_per_sector as u64
    }

    /// Slots in the data sectors, empty ones included.
    pub fn num_slots(&self) -> u64 {
        self.header.num_data_sectors * self.header.nodes_per_sector as u64
    }

    /// Decode the record stored at layout `position`; `None` for an empty
    /// slot.
    pub fn record_at(&self, position: u64) -> Result<Option<NodeRecord>> {
        if position >= self.num_slots() {
            return Err(BuildError::corrupt(
                Phase::Layout,
                &self.path,
                format!("position {position} beyond {} slots", self.num_slots()),
            ));
        }
        let sector = self.sector(self.sector_of_position(position))?;
        let slot = (position % self.header.nodes_per_sector as u64) as usize;
        let node_len = self.header.node_len as usize;
        let rec = &sector[slot * node_len..(slot + 1) * node_len];

        let id = LittleEndian::read_u32(&rec[0..4]);
        if id == EMPTY_SLOT {
            return Ok(None);
        }
        let payload_len = self.header.payload_len();
        let payload_bytes = &rec[4..4 + payload_len];
        let payload = match self.header.payload {
            PayloadKind::Full => {
                let mut v = vec![0.0f32; self.header.dim as usize];
                LittleEndian::read_f32_into(payload_bytes, &mut v);
                NodePayload::Full(v)
            }
            PayloadKind::Pq => NodePayload::Pq(payload_bytes.to_vec()),
        };
        let at = 4 + payload_len;
        let degree = LittleEndian::read_u32(&rec[at..at + 4]);
        if degree > self.header.max_degree {
            return Err(BuildError::corrupt(
                Phase::Layout,
                &self.path,
                format!("record at position {position} has degree {degree}"),
            ));
        }
        let mut neighbors = vec![0u32; degree as usize];
        LittleEndian::read_u32_into(&rec[at + 4..at + 4 + 4 * degree as usize], &mut neighbors);

        Ok(Some(NodeRecord {
            id,
            payload,
            neighbors,
        }))
    }

    /// Decode the record of `node`, wherever it was placed.
    pub fn read_node(&self, node: u32) -> Result<NodeRecord> {
        let position = self.position_of(node)?;
        match self.record_at(position)? {
            Some(record) if record.id == node => Ok(record),
            Some(record) => Err(BuildError::corrupt(
                Phase::Layout,
                &self.path,
                format!("location table sends node {node} to a record of node {}", record.id),
            )),
            None => Err(BuildError::corrupt(
                Phase::Layout,
                &self.path,
                format!("location table sends node {node} to empty slot {position}"),
            )),
        }
    }
}
