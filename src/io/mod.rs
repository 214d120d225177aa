//! On-disk formats shared by every build phase.
//!
//! - [`bin`]: `u32 npts | u32 dim | rows` matrices (vectors, id maps, codes)
//! - [`graph`]: variable-degree adjacency files (shard and merged graphs)
//! - [`paths`]: file naming under an index prefix
//!
//! Writers stage into `<path>.tmp` and rename on `finish()`, so a crashed or
//! failed phase never leaves a file that looks complete.

pub mod bin;
pub mod graph;
pub mod paths;

pub use bin::{
    read_bin, read_bin_header, read_idmap, write_bin, BinElement, BinHeader, BinReader, BinWriter,
    VectorStore,
};
pub use graph::{load_graph, GraphHeader, GraphReader, GraphWriter};
pub use paths::IndexPaths;

use crate::error::{IoContext, Phase, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

/// A file being written under a temporary name.
///
/// Dropping it without calling [`Staged::commit`] deletes the temporary file.
#[derive(Debug)]
pub(crate) struct Staged {
    staging: PathBuf,
    target: PathBuf,
    phase: Phase,
    committed: bool,
}

impl Staged {
    pub(crate) fn create(target: &Path, phase: Phase) -> Result<(Self, File)> {
        let mut staging = target.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        let file = File::create(&staging).at(phase, &staging)?;
        Ok((
            Self {
                staging,
                target: target.to_path_buf(),
                phase,
                committed: false,
            },
            file,
        ))
    }

    pub(crate) fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub(crate) fn commit(mut self) -> Result<()> {
        std::fs::rename(&self.staging, &self.target).at(self.phase, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

/// Publish staged files as one unit. If a rename fails, files this call
/// already published are removed and the rest stay unpublished.
pub(crate) fn commit_together(stages: Vec<Staged>) -> Result<()> {
    let mut published: Vec<PathBuf> = Vec::with_capacity(stages.len());
    for stage in stages {
        let target = stage.target.clone();
        if let Err(e) = stage.commit() {
            for path in &published {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }
        published.push(target);
    }
    Ok(())
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}
