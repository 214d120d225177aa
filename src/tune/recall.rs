//! Recall metrics.

use std::collections::HashSet;

/// Mean recall@`recall_at` as a fraction in `[0, 1]`.
///
/// When `gt_dists` is given, ground-truth entries past position `recall_at`
/// whose distance equals the `recall_at`-th distance also count as hits.
/// A query whose ground truth is shorter than `recall_at` is scored against
/// the entries it has. Queries with empty ground truth are skipped; if every
/// query is skipped the result is 0.
pub fn calculate_recall(
    gt: &[Vec<u32>],
    gt_dists: Option<&[Vec<f32>]>,
    results: &[Vec<u32>],
    recall_at: usize,
) -> f64 {
    if recall_at == 0 {
        return 0.0;
    }
    let mut hits = 0usize;
    let mut denominator = 0usize;

    for (q, (truth, found)) in gt.iter().zip(results).enumerate() {
        if truth.is_empty() {
            continue;
        }
        let mut tie_breaker = recall_at.min(truth.len());
        if let Some(dists) = gt_dists.and_then(|d| d.get(q)) {
            if tie_breaker > 0 && tie_breaker <= dists.len() {
                let cutoff = dists[tie_breaker - 1];
                while tie_breaker < truth.len().min(dists.len()) && dists[tie_breaker] == cutoff {
                    tie_breaker += 1;
                }
            }
        }

        let truth_set: HashSet<u32> = truth[..tie_breaker].iter().copied().collect();
        hits += found
            .iter()
            .take(recall_at)
            .filter(|id| truth_set.contains(id))
            .count();
        denominator += recall_at.min(truth.len());
    }

    if denominator == 0 {
        0.0
    } else {
        hits as f64 / denominator as f64
    }
}

/// Recall counting only ground-truth ids present in `active_tags`.
///
/// For each query the first `recall_at` active ground-truth ids form the
/// target set. Queries with no active ground truth are skipped.
pub fn calculate_recall_with_active_tags(
    gt: &[Vec<u32>],
    results: &[Vec<u32>],
    recall_at: usize,
    active_tags: &HashSet<u32>,
) -> f64 {
    let mut hits = 0usize;
    let mut denominator = 0usize;

    for (truth, found) in gt.iter().zip(results) {
        let active: HashSet<u32> = truth
            .iter()
            .copied()
            .filter(|id| active_tags.contains(id))
            .take(recall_at)
            .collect();
        if active.is_empty() {
            continue;
        }
        hits += found
            .iter()
            .take(recall_at)
            .filter(|id| active.contains(id))
            .count();
        denominator += active.len();
    }

    if denominator == 0 {
        0.0
    } else {
        hits as f64 / denominator as f64
    }
}

/// Mean fraction of each query's range ground truth that was returned.
/// A query whose ground truth is empty has recall 1.
pub fn calculate_range_search_recall(gt: &[Vec<u32>], results: &[Vec<u32>]) -> f64 {
    if gt.is_empty() {
        return 0.0;
    }
    let total: f64 = gt
        .iter()
        .zip(results.iter().chain(std::iter::repeat(&Vec::new())))
        .map(|(truth, found)| {
            if truth.is_empty() {
                return 1.0;
            }
            let truth_set: HashSet<u32> = truth.iter().copied().collect();
            let found_set: HashSet<u32> = found.iter().copied().collect();
            truth_set.intersection(&found_set).count() as f64 / truth_set.len() as f64
        })
        .sum();
    total / gt.len() as f64
}
