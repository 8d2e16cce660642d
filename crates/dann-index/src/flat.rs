//! Brute-force flat index: exact scan over a contiguous vector buffer.

use crate::distance::{l2_distance, TopK};
use dann_core::{DannError, Result, SearchResult, VectorId};
use std::collections::HashMap;

/// Exhaustive-scan index. Every query touches every stored vector, so it is
/// exact; useful as a baseline and for small corpora.
#[derive(Debug, Default)]
pub struct FlatIndex {
    dim: usize,
    ids: Vec<VectorId>,
    /// `ids.len() * dim` floats, insertion order.
    vectors: Vec<f32>,
    positions: HashMap<VectorId, usize>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            vectors: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn get(&self, id: VectorId) -> Option<&[f32]> {
        self.positions
            .get(&id)
            .map(|&pos| &self.vectors[pos * self.dim..(pos + 1) * self.dim])
    }

    /// Appends one vector.
    pub fn add(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(DannError::dimension_mismatch(self.dim, vector.len()));
        }
        self.positions.insert(id, self.ids.len());
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
        Ok(())
    }

    /// Removes `id`, shifting later entries down so scans keep observing
    /// insertion order.
    pub fn remove(&mut self, id: VectorId) -> bool {
        let Some(pos) = self.positions.remove(&id) else {
            return false;
        };
        self.ids.remove(pos);
        self.vectors.drain(pos * self.dim..(pos + 1) * self.dim);
        for (i, moved) in self.ids.iter().enumerate().skip(pos) {
            self.positions.insert(*moved, i);
        }
        true
    }

    /// Exact top-k scan in insertion order; ties break to the smaller id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.dim {
            return Err(DannError::dimension_mismatch(self.dim, query.len()));
        }
        let mut top = TopK::new(k);
        for (i, vector) in self.vectors.chunks_exact(self.dim).enumerate() {
            top.push(self.ids[i], l2_distance(vector, query));
        }
        Ok(top.into_sorted_vec())
    }

    /// Iterates `(id, vector)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (VectorId, &[f32])> {
        self.ids
            .iter()
            .copied()
            .zip(self.vectors.chunks_exact(self.dim))
    }
}

// =============================================================================
// Tests
// =============================================================================
