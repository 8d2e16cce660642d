//! The closed set of index backends behind one capability surface.

use crate::flat::FlatIndex;
use crate::ivf::{DistributedIvfIndex, IvfConfig};
use dann_core::{DannError, IndexType, Result, SearchResult, VectorId};
use tracing::debug;

/// One of the supported engines. `Hnsw` is part of the public vocabulary
/// but not provided; constructing it fails with `BadRequest`.
pub enum IndexBackend {
    Flat(FlatIndex),
    Ivf(DistributedIvfIndex),
}

impl IndexBackend {
    /// Builds a backend of the requested type.
    pub fn new(index_type: IndexType, config: IvfConfig) -> Result<Self> {
        match index_type {
            IndexType::Flat => Ok(IndexBackend::Flat(FlatIndex::new(config.dim))),
            IndexType::Ivf => Ok(IndexBackend::Ivf(DistributedIvfIndex::new("local", config))),
            IndexType::Hnsw => Err(DannError::BadRequest("unsupported index type".into())),
        }
    }

    pub fn index_type(&self) -> IndexType {
        match self {
            IndexBackend::Flat(_) => IndexType::Flat,
            IndexBackend::Ivf(_) => IndexType::Ivf,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            IndexBackend::Flat(index) => index.dimension(),
            IndexBackend::Ivf(index) => index.dimension(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexBackend::Flat(index) => index.len(),
            IndexBackend::Ivf(index) => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat indexes are always ready; IVF is ready once built.
    pub fn is_trained(&self) -> bool {
        match self {
            IndexBackend::Flat(_) => true,
            IndexBackend::Ivf(index) => index.is_trained(),
        }
    }

    /// Appends a batch of vectors (`ids.len() * dim` floats).
    ///
    /// The first batch into an untrained IVF backend builds the index,
    /// training the centroid table from it; later batches append to the
    /// existing centroids' posting lists without re-clustering.
    pub fn add_batch(&mut self, vectors: &[f32], ids: &[VectorId]) -> Result<()> {
        match self {
            IndexBackend::Flat(index) => {
                for (i, vector) in vectors.chunks_exact(index.dimension()).enumerate() {
                    index.add(ids[i], vector)?;
                }
                Ok(())
            }
            IndexBackend::Ivf(index) => {
                if !index.is_trained() {
                    debug!(n = ids.len(), "first batch trains the IVF backend");
                    index.build(vectors, ids)
                } else {
                    for (i, vector) in vectors.chunks_exact(index.dimension()).enumerate() {
                        index.insert(ids[i], vector)?;
                    }
                    Ok(())
                }
            }
        }
    }

    pub fn remove(&mut self, id: VectorId) -> bool {
        match self {
            IndexBackend::Flat(index) => index.remove(id),
            IndexBackend::Ivf(index) => index.remove(id),
        }
    }

    pub fn contains(&self, id: VectorId) -> bool {
        match self {
            IndexBackend::Flat(index) => index.contains(id),
            IndexBackend::Ivf(index) => index.contains(id),
        }
    }

    pub fn get(&self, id: VectorId) -> Option<Vec<f32>> {
        match self {
            IndexBackend::Flat(index) => index.get(id).map(|v| v.to_vec()),
            IndexBackend::Ivf(index) => index.get(id),
        }
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        match self {
            IndexBackend::Flat(index) => index.search(query, k),
            IndexBackend::Ivf(index) => index.search(query, k),
        }
    }

    /// IVF search with an explicit probe count; the flat engine ignores it.
    pub fn search_with_nprobe(
        &self,
        query: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchResult>> {
        match self {
            IndexBackend::Flat(index) => index.search(query, k),
            IndexBackend::Ivf(index) => index.search_with_nprobe(query, k, nprobe),
        }
    }
}

impl std::fmt::Debug for IndexBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBackend")
            .field("index_type", &self.index_type().to_string())
            .field("dimension", &self.dimension())
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
