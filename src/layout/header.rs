//! Sector 0 of a disk index.
//!
//! Format (little-endian):
//! - Magic `SHDX` (4 bytes), version (4 bytes)
//! - Node count (8 bytes)
//! - Dimension, max degree, sector size, node length, nodes per sector,
//!   payload kind (4 bytes each)
//! - Data sector count (8 bytes)
//! - PQ chunks, reordered flag (4 bytes each)
//! - Location table sector, 0 when absent (8 bytes)
//! - Primary medoid, medoid count (4 bytes each)
//! - Medoid ids (4 bytes each)
//! - Zero padding to the sector size

use crate::error::{BuildError, Phase, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

pub const LAYOUT_MAGIC: &[u8; 4] = b"SHDX";
pub const LAYOUT_VERSION: u32 = 1;
/// Bytes before the medoid list.
pub const HEADER_FIXED_LEN: usize = 72;

/// What each node record carries besides its adjacency list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// `dim` little-endian `f32`s.
    Full,
    /// One byte per PQ chunk.
    Pq,
}

impl PayloadKind {
    fn code(self) -> u32 {
        match self {
            PayloadKind::Full => 0,
            PayloadKind::Pq => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PayloadKind::Full),
            1 => Some(PayloadKind::Pq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutHeader {
    pub num_nodes: u64,
    pub dim: u32,
    pub max_degree: u32,
    pub sector_size: u32,
    /// Bytes of one node record.
    pub node_len: u32,
    pub nodes_per_sector: u32,
    pub payload: PayloadKind,
    pub num_data_sectors: u64,
    pub pq_chunks: u32,
    pub reordered: bool,
    /// First sector of the node -> position table, or 0.
    pub location_table_sector: u64,
    pub medoids: Vec<u32>,
}

impl LayoutHeader {
    /// Payload bytes inside one record.
    pub fn payload_len(&self) -> usize {
        match self.payload {
            PayloadKind::Full => self.dim as usize * 4,
            PayloadKind::Pq => self.pq_chunks as usize,
        }
    }

    /// Sectors taken by the location table.
    pub fn location_table_sectors(&self) -> u64 {
        if self.reordered {
            (self.num_nodes * 4).div_ceil(self.sector_size as u64)
        } else {
            0
        }
    }

    /// Expected file length in bytes.
    pub fn file_len(&self) -> u64 {
        (1 + self.num_data_sectors + self.location_table_sectors()) * self.sector_size as u64
    }

    /// Most medoids a header sector of `sector_size` can list.
    pub fn max_medoids(sector_size: usize) -> usize {
        sector_size.saturating_sub(HEADER_FIXED_LEN) / 4
    }

    /// Serialize into one zero-padded sector.
    pub fn to_sector(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.sector_size as usize];
        buf[0..4].copy_from_slice(LAYOUT_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], LAYOUT_VERSION);
        LittleEndian::write_u64(&mut buf[8..16], self.num_nodes);
        LittleEndian::write_u32(&mut buf[16..20], self.dim);
        LittleEndian::write_u32(&mut buf[20..24], self.max_degree);
        LittleEndian::write_u32(&mut buf[24..28], self.sector_size);
        LittleEndian::write_u32(&mut buf[28..32], self.node_len);
        LittleEndian::write_u32(&mut buf[32..36], self.nodes_per_sector);
        LittleEndian::write_u32(&mut buf[36..40], self.payload.code());
        LittleEndian::write_u64(&mut buf[40..48], self.num_data_sectors);
        LittleEndian::write_u32(&mut buf[48..52], self.pq_chunks);
        LittleEndian::write_u32(&mut buf[52..56], self.reordered as u32);
        LittleEndian::write_u64(&mut buf[56..64], self.location_table_sector);
        LittleEndian::write_u32(&mut buf[64..68], self.medoids.first().copied().unwrap_or(0));
        LittleEndian::write_u32(&mut buf[68..72], self.medoids.len() as u32);
        for (i, &m) in self.medoids.iter().enumerate() {
            let at = HEADER_FIXED_LEN + 4 * i;
            LittleEndian::write_u32(&mut buf[at..at + 4], m);
        }
        buf
    }

    /// Parse a header sector.
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        let bad = |reason: String| Err(BuildError::corrupt(Phase::Layout, path, reason));
        if bytes.len() < HEADER_FIXED_LEN {
            return bad(format!("{} bytes is too short for a header", bytes.len()));
        }
        if &bytes[0..4] != LAYOUT_MAGIC {
            return bad("not a disk index (bad magic)".into());
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != LAYOUT_VERSION {
            return bad(format!("unsupported layout version {version}"));
        }
        let Some(payload) = PayloadKind::from_code(LittleEndian::read_u32(&bytes[36..40])) else {
            return bad("unknown payload kind".into());
        };

        let num_medoids = LittleEndian::read_u32(&bytes[68..72]) as usize;
        let sector_size = LittleEndian::read_u32(&bytes[24..28]);
        if num_medoids > Self::max_medoids(sector_size as usize)
            || HEADER_FIXED_LEN + 4 * num_medoids > bytes.len()
        {
            return bad(format!("{num_medoids} medoids do not fit the header sector"));
        }
        let medoids = (0..num_medoids)
            .map(|i| {
                let at = HEADER_FIXED_LEN + 4 * i;
                LittleEndian::read_u32(&bytes[at..at + 4])
            })
            .collect();

        let header = Self {
            num_nodes: LittleEndian::read_u64(&bytes[8..16]),
            dim: LittleEndian::read_u32(&bytes[16..20]),
            max_degree: LittleEndian::read_u32(&bytes[20..24]),
            sector_size,
            node_len: LittleEndian::read_u32(&bytes[28..32]),
            nodes_per_sector: LittleEndian::read_u32(&bytes[32..36]),
            payload,
            num_data_sectors: LittleEndian::read_u64(&bytes[40..48]),
            pq_chunks: LittleEndian::read_u32(&bytes[48..52]),
            reordered: LittleEndian::read_u32(&bytes[52..56]) != 0,
            location_table_sector: LittleEndian::read_u64(&bytes[56..64]),
            medoids,
        };

        let record = 8 + header.payload_len() as u64 + 4 * header.max_degree as u64;
        if header.node_len as u64 != record
            || header.nodes_per_sector == 0
            || header.node_len as u64 * header.nodes_per_sector as u64 > sector_size as u64
        {
            return bad(format!(
                "record of {} bytes x {} per sector inconsistent with sector size {sector_size}",
                header.node_len, header.nodes_per_sector
            ));
        }
        Ok(header)
    }
}
