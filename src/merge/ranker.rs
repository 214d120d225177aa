//! Edge priorities used when a merged adjacency list exceeds the degree bound.

use crate::distance::DistanceMetric;
use crate::error::{BuildError, Phase, Result};
use crate::io::VectorStore;
use std::path::{Path, PathBuf};

/// Priority of candidate edges out of one node; lower survives.
pub trait EdgeRanker: Sync {
    /// One priority per candidate, in candidate order.
    fn priorities(&self, node: u32, candidates: &[u32]) -> Result<Vec<f32>>;
}

/// Ranks edges by distance between the endpoint vectors.
pub struct DistanceRanker {
    store: VectorStore,
    metric: DistanceMetric,
    path: PathBuf,
}

impl DistanceRanker {
    /// Memory-map the base vectors at `base`.
    pub fn open(base: &Path, metric: DistanceMetric) -> Result<Self> {
        Ok(Self {
            store: VectorStore::open(base, Phase::Merge)?,
            metric,
            path: base.to_path_buf(),
        })
    }

    fn check(&self, id: u32) -> Result<()> {
        if (id as usize) < self.store.npts() {
            Ok(())
        } else {
            Err(BuildError::corrupt(
                Phase::Merge,
                &self.path,
                format!("node {id} has no vector ({} stored)", self.store.npts()),
            ))
        }
    }
}

impl EdgeRanker for DistanceRanker {
    fn priorities(&self, node: u32, candidates: &[u32]) -> Result<Vec<f32>> {
        self.check(node)?;
        let from = self.store.vector(node as usize);
        let mut to = vec![0.0f32; self.store.dim()];
        candidates
            .iter()
            .map(|&c| {
                self.check(c)?;
                self.store.read_into(c as usize, &mut to);
                Ok(self.metric.distance(&from, &to))
            })
            .collect()
    }
}

/// Ranks every edge equally, so pruning keeps the lowest ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdOrderRanker;

impl EdgeRanker for IdOrderRanker {
    fn priorities(&self, _node: u32, candidates: &[u32]) -> Result<Vec<f32>> {
        Ok(vec![0.0; candidates.len()])
    }
}

/// Keep the `max_degree` best candidates, ordered by ascending priority with
/// ties going to the lower id. Lists already within the bound are returned
/// unchanged.
pub fn prune_to_degree<R: EdgeRanker + ?Sized>(
    node: u32,
    candidates: Vec<u32>,
    max_degree: usize,
    ranker: &R,
) -> Result<Vec<u32>> {
    if candidates.len() <= max_degree {
        return Ok(candidates);
    }
    let priorities = ranker.priorities(node, &candidates)?;
    let mut scored: Vec<(f32, u32)> = priorities.into_iter().zip(candidates).collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.truncate(max_degree);
    Ok(scored.into_iter().map(|(_, id)| id).collect())
}
