//! Error types for the build pipeline.
//!
//! Every variant names the [`Phase`] it came from and the file, shard or node
//! that triggered it. Out-of-core builds run for hours; a bare "I/O error"
//! would force a blind re-run of the whole pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Build phase in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Parameter validation before any output is written.
    Config,
    /// Sampling and shard partitioning.
    Partition,
    /// Per-shard graph construction.
    ShardBuild,
    /// Shard graph merge.
    Merge,
    /// Product quantization training and encoding.
    Pq,
    /// Sector layout serialization.
    Layout,
    /// Locality reordering.
    Reorder,
    /// Beamwidth tuning.
    Tune,
    /// Cache warmup.
    Warmup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Partition => "partition",
            Phase::ShardBuild => "shard-build",
            Phase::Merge => "merge",
            Phase::Pq => "pq",
            Phase::Layout => "layout",
            Phase::Reorder => "reorder",
            Phase::Tune => "tune",
            Phase::Warmup => "warmup",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while building or inspecting a disk index.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid parameter; detected before any output is written.
    #[error("[{phase}] invalid configuration: {reason}")]
    Config { phase: Phase, reason: String },

    /// I/O failure on a specific file.
    #[error("[{phase}] I/O error on {}: {source}", path.display())]
    Io {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exists but its contents are malformed.
    #[error("[{phase}] corrupt file {}: {reason}", path.display())]
    Corrupt {
        phase: Phase,
        path: PathBuf,
        reason: String,
    },

    /// A node record does not fit in one sector.
    #[error("[layout] node {node} needs {record_len} bytes but sector size is {sector_size}")]
    Capacity {
        node: u32,
        record_len: usize,
        sector_size: usize,
    },

    /// Two files (or a file and a parameter) disagree on vector dimension.
    #[error("[{phase}] dimension mismatch on {}: expected {expected}, found {actual}", path.display())]
    DimensionMismatch {
        phase: Phase,
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    /// A node permutation is not a bijection.
    #[error("[reorder] invalid permutation: {0}")]
    InvalidPermutation(String),

    /// Error reported by the external query engine.
    #[error("[{phase}] query engine error: {reason}")]
    Engine { phase: Phase, reason: String },
}

impl BuildError {
    /// Configuration error.
    pub fn config(phase: Phase, reason: impl Into<String>) -> Self {
        BuildError::Config {
            phase,
            reason: reason.into(),
        }
    }

    /// Corrupt-file error.
    pub fn corrupt(phase: Phase, path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        BuildError::Corrupt {
            phase,
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// The phase that produced this error.
    pub fn phase(&self) -> Phase {
        match self {
            BuildError::Config { phase, .. }
            | BuildError::Io { phase, .. }
            | BuildError::Corrupt { phase, .. }
            | BuildError::DimensionMismatch { phase, .. }
            | BuildError::Engine { phase, .. } => *phase,
            BuildError::Capacity { .. } => Phase::Layout,
            BuildError::InvalidPermutation(_) => Phase::Reorder,
        }
    }
}

/// Attach phase and path context to `std::io` results.
pub trait IoContext<T> {
    /// Convert an I/O error into [`BuildError::Io`].
    fn at(self, phase: Phase, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn at(self, phase: Phase, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| {
            // A short read means the file is truncated, not that the disk failed.
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                BuildError::corrupt(phase, path, "unexpected end of file")
            } else {
                BuildError::Io {
                    phase,
                    path: path.as_ref().to_path_buf(),
                    source,
                }
            }
        })
    }
}

/// Result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
