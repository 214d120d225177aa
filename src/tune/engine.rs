//! Beam search over a sector layout, with PQ-guided candidate ordering.

use super::{QueryEngine, QueryStats, SearchOutput};
use crate::distance::DistanceMetric;
use crate::error::{BuildError, Phase, Result};
use crate::io::{read_bin, IndexPaths, VectorStore};
use crate::layout::{DiskIndexReader, NodePayload};
use crate::quantization::PqCodebook;
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

/// Candidate in the search list.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist: f32,
    id: u32,
    expanded: bool,
}

/// Reference engine for tuning and end-to-end checks.
///
/// Neighbour distances come from in-memory PQ codes; a node's exact distance
/// is taken once its sector is read, from the full vector in the record or
/// from the re-rank file when the layout stores PQ payloads.
pub struct SectorSearchEngine {
    reader: DiskIndexReader,
    codebook: PqCodebook,
    codes: Vec<u8>,
    rerank: Option<VectorStore>,
    metric: DistanceMetric,
}

impl SectorSearchEngine {
    pub fn open(
        index: &Path,
        pq_pivots: &Path,
        pq_compressed: &Path,
        rerank: Option<&Path>,
        metric: DistanceMetric,
    ) -> Result<Self> {
        let reader = DiskIndexReader::open(index)?;
        let codebook = PqCodebook::load(pq_pivots)?;
        let dim = reader.header().dim as usize;
        if codebook.dim() != dim {
            return Err(BuildError::DimensionMismatch {
                phase: Phase::Tune,
                path: pq_pivots.to_path_buf(),
                expected: dim,
                actual: codebook.dim(),
            });
        }
        let (codes, shape) = read_bin::<u8>(pq_compressed, Phase::Tune)?;
        if shape.npts as u64 != reader.num_nodes() || shape.dim != codebook.num_chunks() {
            return Err(BuildError::corrupt(
                Phase::Tune,
                pq_compressed,
                format!(
                    "expected {}x{} codes, found {}x{}",
                    reader.num_nodes(),
                    codebook.num_chunks(),
                    shape.npts,
                    shape.dim
                ),
            ));
        }
        let rerank = match rerank {
            Some(path) => {
                let store = VectorStore::open(path, Phase::Tune)?;
                if store.dim() != dim {
                    return Err(BuildError::DimensionMismatch {
                        phase: Phase::Tune,
                        path: path.to_path_buf(),
                        expected: dim,
                        actual: store.dim(),
                    });
                }
                if store.npts() as u64 != reader.num_nodes() {
                    return Err(BuildError::corrupt(
                        Phase::Tune,
                        path,
                        format!(
                            "re-rank file holds {} vectors for {} nodes",
                            store.npts(),
                            reader.num_nodes()
                        ),
                    ));
                }
                Some(store)
            }
            None => None,
        };
        Ok(Self {
            reader,
            codebook,
            codes,
            rerank,
            metric,
        })
    }

    /// Open the engine over the files a build left under `paths`.
    pub fn from_paths(paths: &IndexPaths, metric: DistanceMetric) -> Result<Self> {
        let rerank = paths.rerank_vectors();
        Self::open(
            &paths.disk_index(),
            &paths.pq_pivots(),
            &paths.pq_compressed(),
            rerank.exists().then_some(rerank.as_path()),
            metric,
        )
    }

    pub fn reader(&self) -> &DiskIndexReader {
        &self.reader
    }

    fn approx_distance(&self, table: &[f32], node: u32) -> Result<f32> {
        let m = self.codebook.num_chunks();
        let start = node as usize * m;
        let row = self.codes.get(start..start + m).ok_or_else(|| BuildError::Engine {
            phase: Phase::Tune,
            reason: format!("neighbour {node} has no PQ code"),
        })?;
        Ok(self.codebook.table_distance(table, row))
    }

    fn exact_distance(&self, query: &[f32], node: u32, payload: &NodePayload, table: &[f32]) -> Result<f32> {
        match (payload, &self.rerank) {
            (NodePayload::Full(v), _) => Ok(self.metric.distance(query, v)),
            (NodePayload::Pq(_), Some(store)) => Ok(self.metric.distance(query, &store.vector(node as usize))),
            (NodePayload::Pq(_), None) => self.approx_distance(table, node),
        }
    }
}

fn insert_candidate(list: &mut Vec<Candidate>, cand: Candidate, capacity: usize) {
    let at = list.partition_point(|c| (c.dist, c.id) < (cand.dist, cand.id));
    if at >= capacity {
        return;
    }
    list.insert(at, cand);
    list.truncate(capacity);
}

impl QueryEngine for SectorSearchEngine {
    fn search(
        &self,
        query: &[f32],
        k: usize,
        search_list_size: u32,
        beamwidth: u32,
    ) -> Result<SearchOutput> {
        let started = Instant::now();
        let dim = self.reader.header().dim as usize;
        if query.len() != dim {
            return Err(BuildError::Engine {
                phase: Phase::Tune,
                reason: format!("query has dim {} but index has dim {dim}", query.len()),
            });
        }
        let capacity = (search_list_size as usize).max(k).max(1);
        let beamwidth = beamwidth.max(1) as usize;
        let table = self.codebook.distance_table(query);

        let mut list: Vec<Candidate> = Vec::with_capacity(capacity + 1);
        let mut visited: HashSet<u32> = HashSet::new();
        for &m in &self.reader.header().medoids {
            if visited.insert(m) {
                let dist = self.approx_distance(&table, m)?;
                insert_candidate(&mut list, Candidate { dist, id: m, expanded: false }, capacity);
            }
        }

        let mut exact: Vec<(f32, u32)> = Vec::new();
        let mut stats = QueryStats::default();
        loop {
            let frontier: Vec<u32> = list
                .iter_mut()
                .filter(|c| !c.expanded)
                .take(beamwidth)
                .map(|c| {
                    c.expanded = true;
                    c.id
                })
                .collect();
            if frontier.is_empty() {
                break;
            }
            stats.n_hops += 1;

            let mut sectors = HashSet::new();
            for node in frontier {
                let pos = self.reader.position_of(node)?;
                sectors.insert(self.reader.sector_of_position(pos));
                let record = self.reader.read_node(node)?;
                exact.push((self.exact_distance(query, node, &record.payload, &table)?, node));
                for &nb in &record.neighbors {
                    if visited.insert(nb) {
                        let dist = self.approx_distance(&table, nb)?;
                        insert_candidate(&mut list, Candidate { dist, id: nb, expanded: false }, capacity);
                    }
                }
            }
            stats.n_ios += sectors.len() as u32;
        }

        exact.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        exact.truncate(k);
        stats.latency_us = started.elapsed().as_secs_f64() * 1e6;
        Ok(SearchOutput {
            ids: exact.iter().map(|&(_, id)| id).collect(),
            distances: exact.iter().map(|&(d, _)| d).collect(),
            stats,
        })
    }
}
