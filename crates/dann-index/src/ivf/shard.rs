//! One shard of the inverted file: a subset of posting lists keyed by
//! centroid id.

use super::list::InvertedList;
use crate::distance::{l2_distance, TopK};
use dann_core::{SearchResult, VectorId};
use std::collections::HashMap;

/// Owns the posting lists for the centroids mapped to this shard.
///
/// Scans are read-only; the owning index serializes writers against readers
/// with the shard's lock.
#[derive(Debug)]
pub struct IvfShard {
    shard_id: u32,
    dim: usize,
    postings: HashMap<i64, InvertedList>,
}

impl IvfShard {
    pub fn new(shard_id: u32, dim: usize) -> Self {
        Self {
            shard_id,
            dim,
            postings: HashMap::new(),
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Appends `list` to the posting for `centroid_id`, creating the entry
    /// on first sight. Member insertion order is preserved.
    pub fn add_posting(&mut self, centroid_id: i64, list: InvertedList) {
        self.postings
            .entry(centroid_id)
            .or_default()
            .append(&list);
    }

    /// Appends one vector to the posting for `centroid_id`.
    pub fn push(&mut self, centroid_id: i64, id: VectorId, vector: &[f32]) {
        self.postings
            .entry(centroid_id)
            .or_default()
            .push(id, vector);
    }

    /// Scans the given probes, returning at most `k` results sorted
    /// ascending by `(distance, id)`.
    ///
    /// Members are scanned in insertion order; the bounded heap keyed
    /// `(distance, id)` breaks ties toward the smaller id. Probes this shard
    /// does not own are skipped.
    pub fn search(&self, probes: &[i64], query: &[f32], k: usize) -> Vec<SearchResult> {
        let mut top = TopK::new(k);
        for centroid_id in probes {
            let Some(list) = self.postings.get(centroid_id) else {
                continue;
            };
            for (id, vector) in list.iter(self.dim) {
                top.push(id, l2_distance(vector, query));
            }
        }
        top.into_sorted_vec()
    }

    /// Removes `id` from whichever posting holds it.
    pub fn remove(&mut self, id: VectorId) -> bool {
        for list in self.postings.values_mut() {
            if list.remove(id, self.dim) {
                return true;
            }
        }
        false
    }

    /// Looks up the vector stored under `id`.
    pub fn get(&self, id: VectorId) -> Option<&[f32]> {
        for list in self.postings.values() {
            if let Some(pos) = list.ids().iter().position(|&x| x == id) {
                return Some(list.vector_at(pos, self.dim));
            }
        }
        None
    }

    /// Total members across all postings.
    pub fn len(&self) -> usize {
        self.postings.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.values().all(|l| l.is_empty())
    }

    /// Number of members in one posting.
    pub fn posting_len(&self, centroid_id: i64) -> usize {
        self.postings.get(&centroid_id).map(|l| l.len()).unwrap_or(0)
    }

    /// Iterates `(centroid_id, posting)` pairs. Order is unspecified;
    /// callers that need determinism sort by centroid id.
    pub fn postings(&self) -> impl Iterator<Item = (i64, &InvertedList)> {
        self.postings.iter().map(|(&c, l)| (c, l))
    }
}

// =============================================================================
// Tests
// =============================================================================
