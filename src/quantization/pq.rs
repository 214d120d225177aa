use crate::config::Tunables;
use crate::distance::l2_squared;
use crate::error::{BuildError, IoContext, Phase, Result};
use crate::io::{read_bin_header, BinReader, BinWriter, VectorStore};
use crate::partitioning::best_of_restarts;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

/// Leading bytes of a pivots file.
pub const PQ_PIVOTS_MAGIC: [u8; 4] = *b"PQPV";

/// Number of PQ chunks such that `n_points × chunks` bytes fit `ram_limit`
/// bytes, clamped to `[1, min(dim, max_pq_chunks)]`.
pub fn calculate_num_pq_chunks(
    ram_limit: f64,
    n_points: usize,
    dim: usize,
    tunables: &Tunables,
) -> usize {
    let upper = dim.min(tunables.max_pq_chunks).max(1);
    let raw = if n_points == 0 {
        upper as f64
    } else {
        (ram_limit / n_points as f64).floor()
    };
    let chunks = if raw.is_finite() && raw > 0.0 {
        (raw as usize).clamp(1, upper)
    } else {
        1
    };
    info!(
        ram_limit_gb = ram_limit / (1024.0 * 1024.0 * 1024.0),
        n_points, dim, chunks, "sized PQ chunks"
    );
    chunks
}

/// Chunk boundaries: `num_chunks + 1` offsets from 0 to `dim`.
pub fn chunk_offsets(dim: usize, num_chunks: usize) -> Vec<usize> {
    let low = dim / num_chunks;
    let num_high = dim % num_chunks;
    let mut offsets = Vec::with_capacity(num_chunks + 1);
    let mut at = 0;
    offsets.push(0);
    for chunk in 0..num_chunks {
        at += if chunk < num_high { low + 1 } else { low };
        offsets.push(at);
    }
    offsets
}

/// Uniform sample without replacement of
/// `min(max_pq_training_set_size, fraction × npts)` base vectors.
///
/// Never fewer than `num_pq_centroids` points (or all of them, if the base
/// is smaller).
pub fn sample_training_set(
    base: &Path,
    tunables: &Tunables,
    seed: u64,
) -> Result<(Vec<f32>, usize, usize)> {
    let store = VectorStore::open(base, Phase::Pq)?;
    let npts = store.npts();
    let dim = store.dim();

    let by_fraction = (npts as f64 * tunables.pq_training_set_fraction).ceil() as usize;
    let target = by_fraction
        .min(tunables.max_pq_training_set_size)
        .max(tunables.num_pq_centroids)
        .min(npts);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picks = rand::seq::index::sample(&mut rng, npts, target).into_vec();
    picks.sort_unstable();

    let mut sample = vec![0.0f32; target * dim];
    for (row, &idx) in sample.chunks_exact_mut(dim).zip(&picks) {
        store.read_into(idx, row);
    }
    Ok((sample, target, dim))
}

/// Trained product quantizer.
#[derive(Debug, Clone, PartialEq)]
pub struct PqCodebook {
    dim: usize,
    num_chunks: usize,
    num_centroids: usize,
    /// Mean subtracted before chunking.
    centroid: Vec<f32>,
    offsets: Vec<usize>,
    /// Per chunk: `num_centroids × chunk_dim`, row-major.
    tables: Vec<Vec<f32>>,
}

impl PqCodebook {
    /// Train on `n` row-major vectors.
    pub fn train(
        training: &[f32],
        n: usize,
        dim: usize,
        num_chunks: usize,
        tunables: &Tunables,
        seed: u64,
    ) -> Result<Self> {
        if dim == 0 || num_chunks == 0 || num_chunks > dim {
            return Err(BuildError::config(
                Phase::Pq,
                format!("cannot split dim {dim} into {num_chunks} PQ chunks"),
            ));
        }
        if n == 0 || training.len() < n * dim {
            return Err(BuildError::config(
                Phase::Pq,
                format!("PQ training needs {n} x {dim} values, got {}", training.len()),
            ));
        }
        if tunables.num_pq_centroids == 0 || tunables.num_pq_centroids > 256 {
            return Err(BuildError::config(
                Phase::Pq,
                format!(
                    "PQ codes are one byte; {} centroids per chunk is out of range",
                    tunables.num_pq_centroids
                ),
            ));
        }
        let num_centroids = tunables.num_pq_centroids.min(n);
        if num_centroids < tunables.num_pq_centroids {
            warn!(
                n,
                requested = tunables.num_pq_centroids,
                "fewer training points than PQ centroids"
            );
        }

        let mut centroid = vec![0.0f64; dim];
        for row in training.chunks_exact(dim).take(n) {
            for (c, &v) in centroid.iter_mut().zip(row) {
                *c += v as f64;
            }
        }
        let centroid: Vec<f32> = centroid.iter().map(|&s| (s / n as f64) as f32).collect();

        let offsets = chunk_offsets(dim, num_chunks);
        let tables = (0..num_chunks)
            .into_par_iter()
            .map(|chunk| {
                let (lo, hi) = (offsets[chunk], offsets[chunk + 1]);
                let mut sub = Vec::with_capacity(n * (hi - lo));
                for row in training.chunks_exact(dim).take(n) {
                    sub.extend(row[lo..hi].iter().zip(&centroid[lo..hi]).map(|(v, c)| v - c));
                }
                let (km, distortion) = best_of_restarts(
                    &sub,
                    n,
                    hi - lo,
                    num_centroids,
                    tunables.num_kmeans_reps,
                    tunables.kmeans_iterations,
                    seed.wrapping_add(chunk as u64),
                    Phase::Pq,
                )?;
                tracing::debug!(chunk, distortion, "trained PQ chunk");
                Ok(km.centroids().to_vec())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dim,
            num_chunks,
            num_centroids,
            centroid,
            offsets,
            tables,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    fn center(&self, chunk: usize, c: usize) -> &[f32] {
        let width = self.offsets[chunk + 1] - self.offsets[chunk];
        &self.tables[chunk][c * width..(c + 1) * width]
    }

    /// Encode one vector into `out` (`num_chunks` bytes).
    pub fn encode_into(&self, v: &[f32], out: &mut [u8]) {
        let mut residual = [0.0f32; 64];
        let mut scratch = Vec::new();
        for (chunk, code) in out.iter_mut().enumerate().take(self.num_chunks) {
            let (lo, hi) = (self.offsets[chunk], self.offsets[chunk + 1]);
            let width = hi - lo;
            let shifted: &mut [f32] = if width <= residual.len() {
                &mut residual[..width]
            } else {
                scratch.resize(width, 0.0);
                &mut scratch[..]
            };
            for ((s, &x), &m) in shifted.iter_mut().zip(&v[lo..hi]).zip(&self.centroid[lo..hi]) {
                *s = x - m;
            }

            let mut best = (0usize, f32::INFINITY);
            for c in 0..self.num_centroids {
                let d = l2_squared(shifted, self.center(chunk, c));
                if d < best.1 {
                    best = (c, d);
                }
            }
            *code = best.0 as u8;
        }
    }

    pub fn encode(&self, v: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; self.num_chunks];
        self.encode_into(v, &mut out);
        out
    }

    /// Reconstruct an approximate vector from its codes.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = self.centroid.clone();
        for (chunk, &code) in codes.iter().enumerate().take(self.num_chunks) {
            let lo = self.offsets[chunk];
            for (o, &c) in out[lo..].iter_mut().zip(self.center(chunk, code as usize)) {
                *o += c;
            }
        }
        out
    }

    /// Squared-L2 lookup table for `query`: `num_chunks × num_centroids`.
    pub fn distance_table(&self, query: &[f32]) -> Vec<f32> {
        let mut table = Vec::with_capacity(self.num_chunks * self.num_centroids);
        let mut shifted = Vec::new();
        for chunk in 0..self.num_chunks {
            let (lo, hi) = (self.offsets[chunk], self.offsets[chunk + 1]);
            shifted.clear();
            shifted.extend(query[lo..hi].iter().zip(&self.centroid[lo..hi]).map(|(q, m)| q - m));
            for c in 0..self.num_centroids {
                table.push(l2_squared(&shifted, self.center(chunk, c)));
            }
        }
        table
    }

    /// Approximate squared-L2 distance from a [`PqCodebook::distance_table`].
    #[inline]
    pub fn table_distance(&self, table: &[f32], codes: &[u8]) -> f32 {
        codes
            .iter()
            .enumerate()
            .map(|(chunk, &code)| table[chunk * self.num_centroids + code as usize])
            .sum()
    }

    /// Write the pivots file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let (stage, file) = crate::io::Staged::create(path, Phase::Pq)?;
        let mut w = BufWriter::new(file);
        let io = |r: std::io::Result<()>| r.at(Phase::Pq, path);

        io(w.write_all(&PQ_PIVOTS_MAGIC))?;
        io(w.write_u32::<LittleEndian>(self.dim as u32))?;
        io(w.write_u32::<LittleEndian>(self.num_chunks as u32))?;
        io(w.write_u32::<LittleEndian>(self.num_centroids as u32))?;
        for &v in &self.centroid {
            io(w.write_f32::<LittleEndian>(v))?;
        }
        for &o in &self.offsets {
            io(w.write_u32::<LittleEndian>(o as u32))?;
        }
        for table in &self.tables {
            for &v in table {
                io(w.write_f32::<LittleEndian>(v))?;
            }
        }
        io(w.flush())?;
        let file = w.into_inner().map_err(|e| e.into_error()).at(Phase::Pq, path)?;
        file.sync_all().at(Phase::Pq, path)?;
        drop(file);
        stage.commit()
    }

    /// Read a pivots file written by [`PqCodebook::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).at(Phase::Pq, path)?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).at(Phase::Pq, path)?;
        if magic != PQ_PIVOTS_MAGIC {
            return Err(BuildError::corrupt(Phase::Pq, path, "not a PQ pivots file"));
        }
        let dim = r.read_u32::<LittleEndian>().at(Phase::Pq, path)? as usize;
        let num_chunks = r.read_u32::<LittleEndian>().at(Phase::Pq, path)? as usize;
        let num_centroids = r.read_u32::<LittleEndian>().at(Phase::Pq, path)? as usize;
        if dim == 0 || num_chunks == 0 || num_chunks > dim || num_centroids == 0 || num_centroids > 256
        {
            return Err(BuildError::corrupt(
                Phase::Pq,
                path,
                format!("bad shape: dim {dim}, {num_chunks} chunks, {num_centroids} centroids"),
            ));
        }

        let mut centroid = vec![0.0f32; dim];
        r.read_f32_into::<LittleEndian>(&mut centroid)
            .at(Phase::Pq, path)?;
        let mut raw_offsets = vec![0u32; num_chunks + 1];
        r.read_u32_into::<LittleEndian>(&mut raw_offsets)
            .at(Phase::Pq, path)?;
        let offsets: Vec<usize> = raw_offsets.iter().map(|&o| o as usize).collect();
        let well_formed = offsets.first() == Some(&0)
            && offsets.last() == Some(&dim)
            && offsets.windows(2).all(|w| w[0] < w[1]);
        if !well_formed {
            return Err(BuildError::corrupt(Phase::Pq, path, "chunk offsets are not increasing"));
        }

        let mut tables = Vec::with_capacity(num_chunks);
        for w in offsets.windows(2) {
            let mut table = vec![0.0f32; num_centroids * (w[1] - w[0])];
            r.read_f32_into::<LittleEndian>(&mut table)
                .at(Phase::Pq, path)?;
            tables.push(table);
        }
        let mut rest = [0u8; 1];
        if r.read(&mut rest).at(Phase::Pq, path)? != 0 {
            return Err(BuildError::corrupt(Phase::Pq, path, "trailing bytes after pivots"));
        }

        Ok(Self {
            dim,
            num_chunks,
            num_centroids,
            centroid,
            offsets,
            tables,
        })
    }
}

/// Encode every base vector with `codebook` into a `u8` bin file
/// (`npts × num_chunks`).
pub fn generate_pq_data_from_pivots(
    base: &Path,
    codebook: &PqCodebook,
    compressed: &Path,
    tunables: &Tunables,
) -> Result<usize> {
    let header = read_bin_header::<f32>(base, Phase::Pq)?;
    if header.dim != codebook.dim() {
        return Err(BuildError::DimensionMismatch {
            phase: Phase::Pq,
            path: base.to_path_buf(),
            expected: codebook.dim(),
            actual: header.dim,
        });
    }
    let dim = header.dim;
    let chunks = codebook.num_chunks();

    let mut reader = BinReader::<f32>::open(base, Phase::Pq)?;
    let mut writer = BinWriter::<u8>::create(compressed, Phase::Pq, chunks)?;
    let mut codes = Vec::new();
    loop {
        let block = reader.read_block(tunables.block_size)?;
        if block.is_empty() {
            break;
        }
        codes.resize(block.len() / dim * chunks, 0);
        codes
            .par_chunks_exact_mut(chunks)
            .zip(block.par_chunks_exact(dim))
            .for_each(|(out, v)| codebook.encode_into(v, out));
        writer.write_rows(&codes)?;
    }
    writer.finish()
}

/// Sample, train, persist pivots, and encode the whole base file.
pub fn generate_pq(
    base: &Path,
    pivots: &Path,
    compressed: &Path,
    num_chunks: usize,
    tunables: &Tunables,
    seed: u64,
) -> Result<PqCodebook> {
    let (training, n, dim) = sample_training_set(base, tunables, seed)?;
    info!(
        base = %base.display(),
        train_points = n,
        dim,
        num_chunks,
        "training PQ codebook"
    );
    let codebook = PqCodebook::train(&training, n, dim, num_chunks, tunables, seed)?;
    codebook.save(pivots)?;
    let encoded = generate_pq_data_from_pivots(base, &codebook, compressed, tunables)?;
    info!(encoded, pivots = %pivots.display(), "PQ compression complete");
    Ok(codebook)
}
