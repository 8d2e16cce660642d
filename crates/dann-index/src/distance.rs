//! Squared-L2 distance kernel and argmin over flat centroid buffers.
//!
//! No square root is taken anywhere: squared L2 is monotone in L2, which is
//! sufficient for ranking. The unrolled paths for dimensions 4 and 8 add
//! terms in the same order as the scalar loop, so their results are
//! bit-identical to the general path.

use dann_core::{SearchResult, VectorId};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Squared L2 distance between two equal-length vectors.
#[inline]
pub fn l2_distance(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    match x.len() {
        4 => l2_distance_d4(x, y),
        8 => l2_distance_d8(x, y),
        _ => {
            let mut sum = 0.0f32;
            for i in 0..x.len() {
                let d = x[i] - y[i];
                sum += d * d;
            }
            sum
        }
    }
}

#[inline]
fn l2_distance_d4(x: &[f32], y: &[f32]) -> f32 {
    let d0 = x[0] - y[0];
    let d1 = x[1] - y[1];
    let d2 = x[2] - y[2];
    let d3 = x[3] - y[3];
    ((d0 * d0 + d1 * d1) + d2 * d2) + d3 * d3
}

#[inline]
fn l2_distance_d8(x: &[f32], y: &[f32]) -> f32 {
    let mut sum = l2_distance_d4(&x[..4], &y[..4]);
    let d4 = x[4] - y[4];
    let d5 = x[5] - y[5];
    let d6 = x[6] - y[6];
    let d7 = x[7] - y[7];
    sum += d4 * d4;
    sum += d5 * d5;
    sum += d6 * d6;
    sum += d7 * d7;
    sum
}

/// Index of the candidate closest to `query` in a flat `n x dim` buffer.
///
/// Ties break to the lowest index. The candidate buffer must be non-empty;
/// callers guard the `n == 0` case.
#[inline]
pub fn find_closest(candidates: &[f32], query: &[f32], dim: usize) -> usize {
    debug_assert!(!candidates.is_empty());
    debug_assert_eq!(candidates.len() % dim, 0);
    debug_assert_eq!(query.len(), dim);

    let mut best_idx = 0usize;
    let mut best_dist = f32::MAX;
    for (i, candidate) in candidates.chunks_exact(dim).enumerate() {
        let d = l2_distance(candidate, query);
        if d < best_dist {
            best_dist = d;
            best_idx = i;
        }
    }
    best_idx
}

/// Bounded top-k accumulator keyed by `(distance, id)`.
///
/// A max-heap over `(distance, id)` keeps the current worst candidate at the
/// top; once full, pushing a better candidate evicts it. Among equal
/// distances the larger id is evicted first, so ties resolve to the smaller
/// id. `into_sorted_vec` returns ascending `(distance, id)` order.
pub struct TopK {
    k: usize,
    heap: BinaryHeap<(OrderedFloat<f32>, VectorId)>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    #[inline]
    pub fn push(&mut self, id: VectorId, distance: f32) {
        if self.k == 0 {
            return;
        }
        self.heap.push((OrderedFloat(distance), id));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn into_sorted_vec(self) -> Vec<SearchResult> {
        let mut out: Vec<SearchResult> = self
            .heap
            .into_iter()
            .map(|(d, id)| SearchResult::new(id, d.0))
            .collect();
        out.sort_by_key(|r| (OrderedFloat(r.distance), r.id));
        out
    }
}

/// Sorts candidates ascending by `(distance, id)` and truncates to `k`.
///
/// Used at merge points where per-shard partials are concatenated; the key
/// makes the final ordering independent of arrival order.
pub fn rank_results(mut results: Vec<SearchResult>, k: usize) -> Vec<SearchResult> {
    results.sort_by_key(|r| (OrderedFloat(r.distance), r.id));
    results.truncate(k);
    results
}

/// Merge shard partials, deduplicating by id and keeping the smallest
/// distance for each id, then rank and truncate to `k`.
pub fn merge_deduplicated(partials: Vec<Vec<SearchResult>>, k: usize) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = partials.into_iter().flatten().collect();
    merged.sort_by_key(|r| (OrderedFloat(r.distance), r.id));

    let mut seen = std::collections::HashSet::new();
    merged.retain(|r| seen.insert(r.id));
    merged.truncate(k);
    merged
}

/// Heap-based version of `push_all + into_sorted_vec` over a flat buffer.
///
/// Scans `candidates` (`ids.len() * dim` floats) in document order.
pub fn top_k_flat(
    candidates: &[f32],
    ids: &[VectorId],
    query: &[f32],
    dim: usize,
    k: usize,
) -> Vec<SearchResult> {
    debug_assert_eq!(candidates.len(), ids.len() * dim);
    let mut top = TopK::new(k);
    for (i, candidate) in candidates.chunks_exact(dim).enumerate() {
        top.push(ids[i], l2_distance(candidate, query));
    }
    top.into_sorted_vec()
}

// =============================================================================
// Tests
// =============================================================================
