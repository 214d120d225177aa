//! Row-major binary matrices.
//!
//! Format:
//! - `u32 npts`
//! - `u32 dim`
//! - `npts * dim` little-endian elements
//!
//! Used for base vectors (`f32`), id maps and medoids (`u32`, `dim = 1`),
//! and PQ codes (`u8`).

use super::Staged;
use crate::error::{BuildError, IoContext, Phase, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Header size in bytes.
pub const BIN_HEADER_LEN: u64 = 8;

/// Element types storable in a bin file.
pub trait BinElement: Copy + Default + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    fn read_into<R: Read>(reader: &mut R, out: &mut [Self]) -> std::io::Result<()>;

    fn write_all<W: Write>(writer: &mut W, data: &[Self]) -> std::io::Result<()>;
}

impl BinElement for f32 {
    const SIZE: usize = 4;

    fn read_into<R: Read>(reader: &mut R, out: &mut [Self]) -> std::io::Result<()> {
        reader.read_f32_into::<LittleEndian>(out)
    }

    fn write_all<W: Write>(writer: &mut W, data: &[Self]) -> std::io::Result<()> {
        for &v in data {
            writer.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

impl BinElement for u32 {
    const SIZE: usize = 4;

    fn read_into<R: Read>(reader: &mut R, out: &mut [Self]) -> std::io::Result<()> {
        reader.read_u32_into::<LittleEndian>(out)
    }

    fn write_all<W: Write>(writer: &mut W, data: &[Self]) -> std::io::Result<()> {
        for &v in data {
            writer.write_u32::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

impl BinElement for u8 {
    const SIZE: usize = 1;

    fn read_into<R: Read>(reader: &mut R, out: &mut [Self]) -> std::io::Result<()> {
        reader.read_exact(out)
    }

    fn write_all<W: Write>(writer: &mut W, data: &[Self]) -> std::io::Result<()> {
        writer.write_all(data)
    }
}

/// Shape of a bin file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinHeader {
    pub npts: usize,
    pub dim: usize,
}

/// Read and sanity-check the header of a bin file holding `T`.
pub fn read_bin_header<T: BinElement>(path: &Path, phase: Phase) -> Result<BinHeader> {
    let mut file = File::open(path).at(phase, path)?;
    let header = read_header(&mut file, path, phase)?;
    let actual_len = file.metadata().at(phase, path)?.len();
    let expected_len = BIN_HEADER_LEN + (header.npts * header.dim * T::SIZE) as u64;
    if actual_len != expected_len {
        return Err(BuildError::corrupt(
            phase,
            path,
            format!(
                "header says {}x{} ({} bytes) but file has {} bytes",
                header.npts, header.dim, expected_len, actual_len
            ),
        ));
    }
    Ok(header)
}

fn read_header<R: Read>(reader: &mut R, path: &Path, phase: Phase) -> Result<BinHeader> {
    let npts = reader.read_u32::<LittleEndian>().at(phase, path)? as usize;
    let dim = reader.read_u32::<LittleEndian>().at(phase, path)? as usize;
    Ok(BinHeader { npts, dim })
}

/// Read a whole bin file into memory.
pub fn read_bin<T: BinElement>(path: &Path, phase: Phase) -> Result<(Vec<T>, BinHeader)> {
    let header = read_bin_header::<T>(path, phase)?;
    let file = File::open(path).at(phase, path)?;
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(BIN_HEADER_LEN))
        .at(phase, path)?;
    let mut data = vec![T::default(); header.npts * header.dim];
    T::read_into(&mut reader, &mut data).at(phase, path)?;
    Ok((data, header))
}

/// Write a whole bin file (staged, then renamed).
pub fn write_bin<T: BinElement>(
    path: &Path,
    phase: Phase,
    data: &[T],
    npts: usize,
    dim: usize,
) -> Result<()> {
    if data.len() != npts * dim {
        return Err(BuildError::config(
            phase,
            format!(
                "cannot write {}: {} elements do not form {npts}x{dim}",
                path.display(),
                data.len()
            ),
        ));
    }
    let mut writer = BinWriter::<T>::create(path, phase, dim)?;
    writer.write_rows(data)?;
    writer.finish()?;
    Ok(())
}

/// Read an id map (`u32`, `dim = 1`): row `i` is the global id of local id `i`.
pub fn read_idmap(path: &Path, phase: Phase) -> Result<Vec<u32>> {
    let (ids, header) = read_bin::<u32>(path, phase)?;
    if header.dim != 1 {
        return Err(BuildError::corrupt(
            phase,
            path,
            format!("id map must have dim 1, found {}", header.dim),
        ));
    }
    Ok(ids)
}

/// Streaming bin writer; the row count is patched into the header on finish.
pub struct BinWriter<T: BinElement> {
    writer: BufWriter<File>,
    stage: Staged,
    path: PathBuf,
    phase: Phase,
    dim: usize,
    rows: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: BinElement> BinWriter<T> {
    pub fn create(path: &Path, phase: Phase, dim: usize) -> Result<Self> {
        let (stage, file) = Staged::create(path, phase)?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<LittleEndian>(0).at(phase, path)?;
        writer
            .write_u32::<LittleEndian>(dim as u32)
            .at(phase, path)?;
        Ok(Self {
            writer,
            stage,
            path: path.to_path_buf(),
            phase,
            dim,
            rows: 0,
            _marker: std::marker::PhantomData,
        })
    }

    /// Append one or more whole rows.
    pub fn write_rows(&mut self, rows: &[T]) -> Result<()> {
        if self.dim == 0 || rows.len() % self.dim != 0 {
            return Err(BuildError::config(
                self.phase,
                format!(
                    "row data of length {} is not a multiple of dim {}",
                    rows.len(),
                    self.dim
                ),
            ));
        }
        T::write_all(&mut self.writer, rows).at(self.phase, &self.path)?;
        self.rows += rows.len() / self.dim;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Patch the header, flush, and publish the file.
    pub fn finish(self) -> Result<usize> {
        let (rows, stage) = self.finish_staged()?;
        stage.commit()?;
        Ok(rows)
    }

    /// Like [`BinWriter::finish`], but leave the file unpublished.
    pub(crate) fn finish_staged(mut self) -> Result<(usize, Staged)> {
        let (phase, path) = (self.phase, self.path.clone());
        self.writer.flush().at(phase, &path)?;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .at(phase, &path)?;
        file.seek(SeekFrom::Start(0)).at(phase, &path)?;
        file.write_u32::<LittleEndian>(self.rows as u32)
            .at(phase, &path)?;
        file.sync_all().at(phase, &path)?;
        drop(file);
        Ok((self.rows, self.stage))
    }
}

/// Streaming bin reader that yields blocks of whole rows.
pub struct BinReader<T: BinElement> {
    reader: BufReader<File>,
    path: PathBuf,
    phase: Phase,
    header: BinHeader,
    consumed: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: BinElement> BinReader<T> {
    pub fn open(path: &Path, phase: Phase) -> Result<Self> {
        let header = read_bin_header::<T>(path, phase)?;
        let file = File::open(path).at(phase, path)?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        reader
            .seek(SeekFrom::Start(BIN_HEADER_LEN))
            .at(phase, path)?;
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            phase,
            header,
            consumed: 0,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn header(&self) -> BinHeader {
        self.header
    }

    /// Read up to `max_rows` rows; empty at end of file.
    pub fn read_block(&mut self, max_rows: usize) -> Result<Vec<T>> {
        let rows = max_rows.min(self.header.npts - self.consumed);
        let mut out = vec![T::default(); rows * self.header.dim];
        T::read_into(&mut self.reader, &mut out).at(self.phase, &self.path)?;
        self.consumed += rows;
        Ok(out)
    }
}

/// Memory-mapped `f32` bin file with random row access.
pub struct VectorStore {
    mmap: Mmap,
    npts: usize,
    dim: usize,
}

impl VectorStore {
    pub fn open(path: &Path, phase: Phase) -> Result<Self> {
        let header = read_bin_header::<f32>(path, phase)?;
        let file = File::open(path).at(phase, path)?;
        // SAFETY: the file is opened read-only and build phases never modify
        // an input file while a later phase reads it.
        let mmap = unsafe { Mmap::map(&file) }.at(phase, path)?;
        Ok(Self {
            mmap,
            npts: header.npts,
            dim: header.dim,
        })
    }

    pub fn npts(&self) -> usize {
        self.npts
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Copy row `idx` into `out` (`out.len() == dim`).
    #[inline]
    pub fn read_into(&self, idx: usize, out: &mut [f32]) {
        debug_assert!(idx < self.npts);
        let start = BIN_HEADER_LEN as usize + idx * self.dim * 4;
        LittleEndian::read_f32_into(&self.mmap[start..start + self.dim * 4], out);
    }

    /// Row `idx` as an owned vector.
    pub fn vector(&self, idx: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.dim];
        self.read_into(idx, &mut out);
        out
    }
}
