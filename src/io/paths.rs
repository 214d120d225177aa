//! File naming under an index prefix.

use std::path::{Path, PathBuf};

/// Every artifact the pipeline reads or writes, derived from one prefix.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    prefix: String,
}

impl IndexPaths {
    pub fn new(prefix: impl AsRef<Path>) -> Self {
        Self {
            prefix: prefix.as_ref().to_string_lossy().into_owned(),
        }
    }

    fn with(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, suffix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn shard_data(&self, shard: usize) -> PathBuf {
        self.with(&format!("_subshard-{shard}.bin"))
    }

    pub fn shard_idmap(&self, shard: usize) -> PathBuf {
        self.with(&format!("_subshard-{shard}_ids_uint32.bin"))
    }

    pub fn shard_graph(&self, shard: usize) -> PathBuf {
        self.with(&format!("_subshard-{shard}_mem.index"))
    }

    pub fn merged_graph(&self) -> PathBuf {
        self.with("_mem.index")
    }

    pub fn medoids(&self) -> PathBuf {
        self.with("_medoids.bin")
    }

    pub fn centroids(&self) -> PathBuf {
        self.with("_centroids.bin")
    }

    pub fn pq_pivots(&self) -> PathBuf {
        self.with("_pq_pivots.bin")
    }

    pub fn pq_compressed(&self) -> PathBuf {
        self.with("_pq_compressed.bin")
    }

    pub fn disk_pq_pivots(&self) -> PathBuf {
        self.with("_disk.index_pq_pivots.bin")
    }

    pub fn disk_pq_compressed(&self) -> PathBuf {
        self.with("_disk.index_pq_compressed.bin")
    }

    pub fn disk_index(&self) -> PathBuf {
        self.with("_disk.index")
    }

    pub fn porder(&self) -> PathBuf {
        self.with("_disk.index_porder.bin")
    }

    pub fn lorder(&self) -> PathBuf {
        self.with("_disk.index_lorder.bin")
    }

    pub fn rerank_vectors(&self) -> PathBuf {
        self.with("_disk.index_rerank.bin")
    }

    pub fn tuning_sample(&self) -> PathBuf {
        self.with("_sample_data.bin")
    }

    pub fn normalized_base(&self) -> PathBuf {
        self.with("_normalized.bin")
    }

    pub fn build_metadata(&self) -> PathBuf {
        self.with("_build.json")
    }
}
