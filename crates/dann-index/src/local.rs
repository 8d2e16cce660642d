//! The per-shard vector container: a polymorphic index with a monotonic
//! version counter and a queue of pending mutation operations feeding the
//! consistency layer.

use crate::backend::IndexBackend;
use crate::ivf::IvfConfig;
use dann_core::{
    now_ms, DannError, IndexOperation, IndexType, OperationKind, Result, SearchResult, VectorId,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info};

struct LocalState {
    backend: IndexBackend,
    pending: Vec<IndexOperation>,
}

/// Thread-safe vector store with version tracking.
///
/// Every successful mutation appends operation records at the current
/// version and then advances the counter, so `version` grows by at least one
/// per mutation and the consistency layer can order replicated writes.
pub struct LocalVectorIndex {
    state: RwLock<LocalState>,
    version: AtomicU64,
}

impl LocalVectorIndex {
    pub fn new(index_type: IndexType, config: IvfConfig) -> Result<Self> {
        let backend = IndexBackend::new(index_type, config)?;
        Ok(Self {
            state: RwLock::new(LocalState {
                backend,
                pending: Vec::new(),
            }),
            version: AtomicU64::new(1),
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Raises the version counter to at least `version`. Never lowers it.
    pub fn set_version(&self, version: u64) {
        self.version.fetch_max(version, Ordering::SeqCst);
    }

    pub fn size(&self) -> usize {
        self.read().backend.len()
    }

    pub fn dimension(&self) -> usize {
        self.read().backend.dimension()
    }

    pub fn index_type(&self) -> IndexType {
        self.read().backend.index_type()
    }

    pub fn is_trained(&self) -> bool {
        self.read().backend.is_trained()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.read().backend.contains(id)
    }

    pub fn get_vector(&self, id: VectorId) -> Option<Vec<f32>> {
        self.read().backend.get(id)
    }

    /// Appends a batch of vectors. Atomic: validation happens before any
    /// mutation, so a rejected batch leaves no partial record.
    pub fn add_vectors(&self, vectors: &[f32], ids: &[VectorId]) -> Result<()> {
        let mut state = self.write();
        let dim = state.backend.dimension();
        Self::validate(vectors, ids, dim)?;

        state.backend.add_batch(vectors, ids)?;

        let version = self.version.load(Ordering::SeqCst);
        let ts = now_ms();
        for (i, vector) in vectors.chunks_exact(dim).enumerate() {
            state.pending.push(
                IndexOperation::new(OperationKind::Add, ids[i], ts, version)
                    .with_vector(vector.to_vec()),
            );
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        debug!(count = ids.len(), version = version, "added vectors");
        Ok(())
    }

    /// Chunks the input and adds it batch by batch, stopping at the first
    /// failing batch.
    pub fn add_vectors_bulk(
        &self,
        vectors: &[f32],
        ids: &[VectorId],
        batch_size: usize,
    ) -> Result<()> {
        let dim = self.dimension();
        Self::validate(vectors, ids, dim)?;
        let batch_size = batch_size.max(1);

        for (chunk_ids, chunk_vectors) in ids
            .chunks(batch_size)
            .zip(vectors.chunks(batch_size * dim))
        {
            self.add_vectors(chunk_vectors, chunk_ids)?;
        }
        Ok(())
    }

    /// Removes `id`, recording a delete operation. `NotFound` leaves no
    /// side effects.
    pub fn remove_vector(&self, id: VectorId) -> Result<()> {
        let mut state = self.write();
        if !state.backend.remove(id) {
            return Err(DannError::NotFound(id));
        }
        let version = self.version.load(Ordering::SeqCst);
        state
            .pending
            .push(IndexOperation::new(OperationKind::Delete, id, now_ms(), version));
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Replaces the vector stored under `id`.
    ///
    /// Delete-then-add under the index write lock: concurrent readers never
    /// observe the id missing.
    pub fn update_vector(&self, id: VectorId, new_vector: &[f32]) -> Result<()> {
        let mut state = self.write();
        let dim = state.backend.dimension();
        if new_vector.len() != dim {
            return Err(DannError::dimension_mismatch(dim, new_vector.len()));
        }
        if !state.backend.remove(id) {
            return Err(DannError::NotFound(id));
        }
        state.backend.add_batch(new_vector, &[id])?;

        let version = self.version.load(Ordering::SeqCst);
        state.pending.push(
            IndexOperation::new(OperationKind::Update, id, now_ms(), version)
                .with_vector(new_vector.to_vec()),
        );
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// k-NN search; negative sentinel labels from the engine are filtered.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let state = self.read();
        let mut results = state.backend.search(query, k)?;
        results.retain(|r| r.id.is_valid());
        Ok(results)
    }

    /// Search with an explicit IVF probe count.
    pub fn search_with_nprobe(
        &self,
        query: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchResult>> {
        let state = self.read();
        let mut results = state.backend.search_with_nprobe(query, k, nprobe)?;
        results.retain(|r| r.id.is_valid());
        Ok(results)
    }

    /// Batched search over `queries.len() / dim` flattened queries.
    pub fn search_batch(&self, queries: &[f32], k: usize) -> Result<Vec<Vec<SearchResult>>> {
        let dim = self.dimension();
        if queries.is_empty() || queries.len() % dim != 0 {
            return Err(DannError::BadRequest(format!(
                "query buffer length {} is not a multiple of dim {}",
                queries.len(),
                dim
            )));
        }
        queries
            .chunks_exact(dim)
            .map(|query| self.search(query, k))
            .collect()
    }

    /// Applies a replicated operation from a peer without recording a new
    /// pending entry. Returns false if the operation is stale (its version
    /// does not advance the local counter's view of that id).
    pub fn apply_remote(&self, op: &IndexOperation) -> Result<bool> {
        let mut state = self.write();
        let applied = match op.kind {
            OperationKind::Add | OperationKind::Update => match &op.vector {
                Some(vector) => {
                    state.backend.remove(op.id);
                    state.backend.add_batch(vector, &[op.id])?;
                    true
                }
                None => {
                    return Err(DannError::BadRequest(format!(
                        "{} operation without a vector payload",
                        op.kind
                    )))
                }
            },
            OperationKind::Delete => state.backend.remove(op.id),
        };
        self.version.fetch_max(op.version + 1, Ordering::SeqCst);
        Ok(applied)
    }

    /// Snapshot of the operations recorded since the last clear. Paired
    /// with [`LocalVectorIndex::clear_pending_operations`], each operation
    /// is observed exactly once per cycle.
    pub fn get_pending_operations(&self) -> Vec<IndexOperation> {
        self.read().pending.clone()
    }

    /// Drains and returns the pending operations in one step.
    pub fn take_pending_operations(&self) -> Vec<IndexOperation> {
        std::mem::take(&mut self.write().pending)
    }

    pub fn clear_pending_operations(&self) {
        self.write().pending.clear();
    }

    /// Serializes the index state plus version counter.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.read();
        crate::persist::save(&state.backend, self.version.load(Ordering::SeqCst), path)
    }

    /// Restores an index saved by [`LocalVectorIndex::save`]. Refuses files
    /// whose dimension disagrees with `expected_dim`.
    pub fn load(path: &Path, expected_dim: usize) -> Result<Self> {
        let (backend, version) = crate::persist::load(path, expected_dim)?;
        info!(path = %path.display(), version = version, "restored local index");
        Ok(Self {
            state: RwLock::new(LocalState {
                backend,
                pending: Vec::new(),
            }),
            version: AtomicU64::new(version),
        })
    }

    fn validate(vectors: &[f32], ids: &[VectorId], dim: usize) -> Result<()> {
        if ids.is_empty() || vectors.is_empty() {
            return Err(DannError::BadRequest("empty input".into()));
        }
        if vectors.len() % dim != 0 {
            return Err(DannError::BadRequest(format!(
                "vector buffer length {} is not a multiple of dim {}",
                vectors.len(),
                dim
            )));
        }
        if vectors.len() / dim != ids.len() {
            return Err(DannError::BadRequest(format!(
                "{} vectors for {} ids",
                vectors.len() / dim,
                ids.len()
            )));
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LocalState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LocalState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for LocalVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("LocalVectorIndex")
            .field("index_type", &state.backend.index_type().to_string())
            .field("dimension", &state.backend.dimension())
            .field("size", &state.backend.len())
            .field("version", &self.version())
            .field("pending", &state.pending.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
