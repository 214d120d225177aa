//! k-means clustering implementation.
//!
//! Squared-L2 k-means used for shard partitioning and PQ codebook training.
//! k-means++ initialization, Lloyd refinement, and best-of-N restarts that
//! keep the lowest-distortion run.

use crate::distance::l2_squared;
use crate::error::{BuildError, Phase, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// k-means clustering over row-major `f32` data.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// Centroids, `k * dimension`, row-major.
    centroids: Vec<f32>,
    dimension: usize,
    k: usize,
    max_iterations: usize,
    seed: u64,
    phase: Phase,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(dimension: usize, k: usize, phase: Phase) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(BuildError::config(
                phase,
                format!("k-means needs dimension > 0 and k > 0, got {dimension} and {k}"),
            ));
        }

        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            max_iterations: 15,
            seed: 0,
            phase,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// Repeated `fit(...)` calls on the same inputs produce identical results.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations.max(1);
        self
    }

    /// Train on `num_vectors` rows. Returns the final distortion (sum of
    /// squared distances to the assigned centroid).
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<f64> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(BuildError::config(
                self.phase,
                format!(
                    "k-means given {} values, needs {num_vectors} x {}",
                    vectors.len(),
                    self.dimension
                ),
            ));
        }
        if num_vectors < self.k {
            return Err(BuildError::config(
                self.phase,
                format!("k-means with k={} needs at least k points, got {num_vectors}", self.k),
            ));
        }

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors);

        let mut distortion = f64::INFINITY;
        for _ in 0..self.max_iterations {
            let (assignments, current) = self.assign_with_distortion(vectors, num_vectors);
            self.update_centroids(vectors, num_vectors, &assignments);

            // Converged once the objective stops moving.
            let improved = distortion - current;
            distortion = current;
            if improved.abs() <= 1e-7 * current.max(1.0) {
                break;
            }
        }
        let (_, final_distortion) = self.assign_with_distortion(vectors, num_vectors);
        Ok(final_distortion)
    }

    /// k-means++ initialization.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = Vec::with_capacity(self.k * self.dimension);

        let first = rng.random_range(0..num_vectors);
        centroids.extend_from_slice(self.row(vectors, first));

        // Distance of every point to its nearest chosen centroid so far.
        let mut nearest: Vec<f32> = (0..num_vectors)
            .map(|i| l2_squared(self.row(vectors, i), &centroids[..self.dimension]))
            .collect();

        for c in 1..self.k {
            let total: f64 = nearest.iter().map(|&d| d as f64).sum();
            let chosen = if total <= 0.0 {
                // All remaining points coincide with a centroid.
                rng.random_range(0..num_vectors)
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                let mut pick = num_vectors - 1;
                for (i, &d) in nearest.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold {
                        pick = i;
                        break;
                    }
                }
                pick
            };
            centroids.extend_from_slice(self.row(vectors, chosen));

            let newest = &centroids[c * self.dimension..(c + 1) * self.dimension];
            nearest
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, d)| *d = d.min(l2_squared(self.row(vectors, i), newest)));
        }

        centroids
    }

    fn assign_with_distortion(&self, vectors: &[f32], num_vectors: usize) -> (Vec<usize>, f64) {
        let pairs: Vec<(usize, f32)> = (0..num_vectors)
            .into_par_iter()
            .map(|i| self.nearest(self.row(vectors, i)))
            .collect();
        let distortion = pairs.iter().map(|&(_, d)| d as f64).sum();
        (pairs.into_iter().map(|(c, _)| c).collect(), distortion)
    }

    /// Assign vectors to nearest clusters.
    pub fn assign_clusters(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        self.assign_with_distortion(vectors, num_vectors).0
    }

    /// Update centroids based on assignments. Empty clusters keep their
    /// previous centroid.
    fn update_centroids(&mut self, vectors: &[f32], num_vectors: usize, assignments: &[usize]) {
        let mut sums = vec![0.0f64; self.k * self.dimension];
        let mut counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            counts[cluster] += 1;
            let base = cluster * self.dimension;
            for (j, &val) in self.row(vectors, i).iter().enumerate() {
                sums[base + j] += val as f64;
            }
        }

        for (cluster, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let base = cluster * self.dimension;
            for j in 0..self.dimension {
                self.centroids[base + j] = (sums[base + j] / count as f64) as f32;
            }
        }
    }

    /// Nearest centroid and its squared distance.
    #[inline]
    pub fn nearest(&self, v: &[f32]) -> (usize, f32) {
        let mut best = (0, f32::INFINITY);
        for c in 0..self.k {
            let d = l2_squared(v, self.centroid(c));
            if d < best.1 {
                best = (c, d);
            }
        }
        best
    }

    /// The `count` nearest centroids, closest first.
    pub fn nearest_n(&self, v: &[f32], count: usize) -> Vec<usize> {
        let mut scored: Vec<(f32, usize)> = (0..self.k)
            .map(|c| (l2_squared(v, self.centroid(c)), c))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(count).map(|(_, c)| c).collect()
    }

    fn row<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    /// Get centroids (row-major).
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    pub fn centroid(&self, c: usize) -> &[f32] {
        &self.centroids[c * self.dimension..(c + 1) * self.dimension]
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Run `reps` independently seeded restarts in parallel and keep the one with
/// the lowest distortion. Ties go to the lower restart index.
#[allow(clippy::too_many_arguments)]
pub fn best_of_restarts(
    vectors: &[f32],
    num_vectors: usize,
    dimension: usize,
    k: usize,
    reps: usize,
    max_iterations: usize,
    seed: u64,
    phase: Phase,
) -> Result<(KMeans, f64)> {
    let runs: Vec<Result<(KMeans, f64)>> = (0..reps.max(1))
        .into_par_iter()
        .map(|rep| {
            let mut km = KMeans::new(dimension, k, phase)?
                .with_seed(seed.wrapping_add(rep as u64 * 0x9E37_79B9_7F4A_7C15))
                .with_max_iterations(max_iterations);
            let distortion = km.fit(vectors, num_vectors)?;
            Ok((km, distortion))
        })
        .collect();

    let mut best: Option<(KMeans, f64)> = None;
    for run in runs {
        let (km, distortion) = run?;
        if best.as_ref().map_or(true, |(_, d)| distortion < *d) {
            best = Some((km, distortion));
        }
    }
    best.ok_or_else(|| BuildError::config(phase, "k-means ran zero restarts"))
}
