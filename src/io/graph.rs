//! Variable-degree adjacency files.
//!
//! Format:
//! - Header (24 bytes):
//!   - File size (8 bytes)
//!   - Max degree (4 bytes)
//!   - Start node (4 bytes)
//!   - Frozen point count (8 bytes)
//! - Nodes, in id order:
//!   - Degree (4 bytes)
//!   - Neighbors (degree * 4 bytes)
//!
//! Shard graphs use local ids; the merged graph uses global ids.

use super::Staged;
use crate::error::{BuildError, IoContext, Phase, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Header size in bytes.
pub const GRAPH_HEADER_LEN: u64 = 24;

/// Adjacency list as read from disk.
pub type Neighbors = SmallVec<[u32; 32]>;

/// Graph file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphHeader {
    pub file_size: u64,
    pub max_degree: u32,
    pub start: u32,
    pub num_frozen: u64,
}

/// Streaming writer for graph files.
pub struct GraphWriter {
    writer: BufWriter<File>,
    stage: Staged,
    path: PathBuf,
    phase: Phase,
    max_degree: u32,
    start: u32,
    bytes: u64,
    nodes: usize,
}

impl GraphWriter {
    pub fn create(path: &Path, phase: Phase, max_degree: u32, start: u32) -> Result<Self> {
        let (stage, file) = Staged::create(path, phase)?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        // Placeholder; patched in finish().
        writer.write_all(&[0u8; GRAPH_HEADER_LEN as usize]).at(phase, path)?;
        Ok(Self {
            writer,
            stage,
            path: path.to_path_buf(),
            phase,
            max_degree,
            start,
            bytes: GRAPH_HEADER_LEN,
            nodes: 0,
        })
    }

    /// Append the adjacency list of the next node.
    pub fn write_node(&mut self, neighbors: &[u32]) -> Result<()> {
        if neighbors.len() > self.max_degree as usize {
            return Err(BuildError::corrupt(
                self.phase,
                &self.path,
                format!(
                    "node {} has degree {} above max_degree {}",
                    self.nodes,
                    neighbors.len(),
                    self.max_degree
                ),
            ));
        }
        self.writer
            .write_u32::<LittleEndian>(neighbors.len() as u32)
            .at(self.phase, &self.path)?;
        for &n in neighbors {
            self.writer
                .write_u32::<LittleEndian>(n)
                .at(self.phase, &self.path)?;
        }
        self.bytes += 4 + 4 * neighbors.len() as u64;
        self.nodes += 1;
        Ok(())
    }

    /// Override the start node recorded in the header.
    pub fn set_start(&mut self, start: u32) {
        self.start = start;
    }

    /// Patch the header and publish. Returns the node count.
    pub fn finish(self) -> Result<usize> {
        let (nodes, stage) = self.finish_staged()?;
        stage.commit()?;
        Ok(nodes)
    }

    /// Like [`GraphWriter::finish`], but leave the file unpublished.
    pub(crate) fn finish_staged(mut self) -> Result<(usize, Staged)> {
        let (phase, path) = (self.phase, self.path.clone());
        self.writer.flush().at(phase, &path)?;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .at(phase, &path)?;
        file.seek(SeekFrom::Start(0)).at(phase, &path)?;
        file.write_u64::<LittleEndian>(self.bytes).at(phase, &path)?;
        file.write_u32::<LittleEndian>(self.max_degree)
            .at(phase, &path)?;
        file.write_u32::<LittleEndian>(self.start).at(phase, &path)?;
        file.write_u64::<LittleEndian>(0).at(phase, &path)?;
        file.sync_all().at(phase, &path)?;
        drop(file);
        Ok((self.nodes, self.stage))
    }
}

/// Streaming reader for graph files.
pub struct GraphReader {
    reader: BufReader<File>,
    path: PathBuf,
    phase: Phase,
    header: GraphHeader,
    offset: u64,
    next_id: u32,
}

impl GraphReader {
    pub fn open(path: &Path, phase: Phase) -> Result<Self> {
        let file = File::open(path).at(phase, path)?;
        let actual = file.metadata().at(phase, path)?.len();
        let mut reader = BufReader::with_capacity(1 << 20, file);

        let header = GraphHeader {
            file_size: reader.read_u64::<LittleEndian>().at(phase, path)?,
            max_degree: reader.read_u32::<LittleEndian>().at(phase, path)?,
            start: reader.read_u32::<LittleEndian>().at(phase, path)?,
            num_frozen: reader.read_u64::<LittleEndian>().at(phase, path)?,
        };
        if header.file_size != actual {
            return Err(BuildError::corrupt(
                phase,
                path,
                format!(
                    "header records {} bytes but file has {actual}",
                    header.file_size
                ),
            ));
        }

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            phase,
            header,
            offset: GRAPH_HEADER_LEN,
            next_id: 0,
        })
    }

    pub fn header(&self) -> GraphHeader {
        self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id of the node the next call to [`GraphReader::next_node`] returns.
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Read the next adjacency list; `None` at end of file.
    pub fn next_node(&mut self) -> Result<Option<Neighbors>> {
        if self.offset >= self.header.file_size {
            return Ok(None);
        }
        let degree = self
            .reader
            .read_u32::<LittleEndian>()
            .at(self.phase, &self.path)?;
        if degree > self.header.max_degree {
            return Err(BuildError::corrupt(
                self.phase,
                &self.path,
                format!(
                    "node {} has degree {degree} above header max_degree {}",
                    self.next_id, self.header.max_degree
                ),
            ));
        }
        let mut neighbors: Neighbors = SmallVec::from_elem(0, degree as usize);
        self.reader
            .read_u32_into::<LittleEndian>(&mut neighbors)
            .at(self.phase, &self.path)?;
        self.offset += 4 + 4 * degree as u64;
        self.next_id += 1;
        Ok(Some(neighbors))
    }

    /// Skip the next adjacency list without materializing it.
    pub fn skip_node(&mut self) -> Result<bool> {
        if self.offset >= self.header.file_size {
            return Ok(false);
        }
        let degree = self
            .reader
            .read_u32::<LittleEndian>()
            .at(self.phase, &self.path)?;
        if degree > self.header.max_degree {
            return Err(BuildError::corrupt(
                self.phase,
                &self.path,
                format!("node {} has degree {degree}", self.next_id),
            ));
        }
        self.reader
            .seek_relative(4 * degree as i64)
            .at(self.phase, &self.path)?;
        self.offset += 4 + 4 * degree as u64;
        self.next_id += 1;
        Ok(true)
    }
}

/// Load a whole graph file. Errors if it does not hold `expected_nodes` nodes
/// (when given) or if any neighbour id is out of range.
pub fn load_graph(
    path: &Path,
    phase: Phase,
    expected_nodes: Option<usize>,
) -> Result<(GraphHeader, Vec<Vec<u32>>)> {
    let mut reader = GraphReader::open(path, phase)?;
    let mut adjacency = Vec::new();
    while let Some(neighbors) = reader.next_node()? {
        adjacency.push(neighbors.to_vec());
    }

    let n = adjacency.len();
    if let Some(expected) = expected_nodes {
        if expected != n {
            return Err(BuildError::corrupt(
                phase,
                path,
                format!("expected {expected} nodes, found {n}"),
            ));
        }
    }
    for (node, neighbors) in adjacency.iter().enumerate() {
        if let Some(&bad) = neighbors.iter().find(|&&v| v as usize >= n) {
            return Err(BuildError::corrupt(
                phase,
                path,
                format!("node {node} points to {bad}, beyond {n} nodes"),
            ));
        }
    }
    Ok((reader.header(), adjacency))
}
