//! The distributed IVF coordinator: owns the centroid table, trains it from
//! a sample, assigns vectors to posting lists, spreads posting lists across
//! shards, and routes searches to the owning shards.

use super::list::InvertedList;
use super::shard::IvfShard;
use crate::distance::{find_closest, l2_distance, rank_results};
use crate::kmeans::{self, KmeansParams};
use dann_core::{DannError, Result, SearchResult, VectorId};
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// Cluster-count heuristic by corpus size.
pub fn default_nlist(n: usize) -> usize {
    if n < 1_000_000 {
        ((8.0 * (n as f64).sqrt()) as usize).max(1)
    } else if n < 10_000_000 {
        1 << 16
    } else if n < 100_000_000 {
        1 << 18
    } else {
        1 << 20
    }
}

/// Configuration for a distributed IVF index.
#[derive(Debug, Clone)]
pub struct IvfConfig {
    pub dim: usize,
    /// Number of shards the posting lists are spread across.
    pub shard_count: u32,
    /// Centroid count; `None` derives it from the corpus size at build.
    pub nlist: Option<usize>,
    /// Probe count used by searches that do not specify one.
    pub nprobe: usize,
    pub kmeans: KmeansParams,
}

impl IvfConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            shard_count: 4,
            nlist: None,
            nprobe: 8,
            kmeans: KmeansParams::default(),
        }
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = Some(nlist);
        self
    }

    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe.max(1);
        self
    }
}

/// Inverted-file index with its posting lists partitioned across shards.
///
/// The centroid table is trained once by [`DistributedIvfIndex::build`] and
/// immutable afterward; incremental inserts append to the existing
/// centroids' posting lists. Posting list for centroid `c` lives on shard
/// `c mod shard_count`.
pub struct DistributedIvfIndex {
    name: String,
    dim: usize,
    shard_count: u32,
    nprobe: usize,
    kmeans: KmeansParams,
    nlist_override: Option<usize>,
    trained: bool,
    /// `nlist * dim` floats, row-major.
    centroids: Vec<f32>,
    /// Parallel id vector `[0 .. nlist-1]`.
    centroid_ids: Vec<i64>,
    shards: Vec<RwLock<IvfShard>>,
    ntotal: usize,
}

impl DistributedIvfIndex {
    pub fn new(name: impl Into<String>, config: IvfConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|id| RwLock::new(IvfShard::new(id, config.dim)))
            .collect();
        Self {
            name: name.into(),
            dim: config.dim,
            shard_count,
            nprobe: config.nprobe,
            kmeans: config.kmeans,
            nlist_override: config.nlist,
            trained: false,
            centroids: Vec::new(),
            centroid_ids: Vec::new(),
            shards,
            ntotal: 0,
        }
    }

    /// Reassembles a trained index from its serialized parts: the centroid
    /// buffer and one posting list per centroid, in centroid-id order.
    pub fn from_parts(
        name: impl Into<String>,
        config: IvfConfig,
        centroids: Vec<f32>,
        lists: Vec<InvertedList>,
    ) -> Self {
        let mut index = Self::new(name, config);
        let nlist = lists.len();
        index.centroids = centroids;
        index.centroid_ids = (0..nlist as i64).collect();
        let mut ntotal = 0;
        for (c, list) in lists.into_iter().enumerate() {
            ntotal += list.len();
            let shard = index.shard_for_centroid(c as i64);
            if let Ok(mut guard) = index.shards[shard as usize].write() {
                guard.add_posting(c as i64, list);
            }
        }
        index.trained = true;
        index.ntotal = ntotal;
        index
    }

    /// The posting list of each centroid in centroid-id order, cloned out
    /// for serialization.
    pub fn posting_lists(&self) -> Vec<InvertedList> {
        let mut lists = vec![InvertedList::new(); self.nlist()];
        for shard in &self.shards {
            if let Ok(guard) = shard.read() {
                for (c, list) in guard.postings() {
                    lists[c as usize] = list.clone();
                }
            }
        }
        lists
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn nlist(&self) -> usize {
        self.centroid_ids.len()
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn default_nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn len(&self) -> usize {
        self.ntotal
    }

    pub fn is_empty(&self) -> bool {
        self.ntotal == 0
    }

    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Shard that owns centroid `c`.
    #[inline]
    pub fn shard_for_centroid(&self, centroid_id: i64) -> u32 {
        (centroid_id as u64 % self.shard_count as u64) as u32
    }

    /// Trains the centroid table and distributes posting lists to shards.
    ///
    /// Re-training an already-trained index requires a full rebuild; this
    /// method rejects the call instead of silently re-clustering.
    pub fn build(&mut self, vectors: &[f32], ids: &[VectorId]) -> Result<()> {
        if self.trained {
            return Err(DannError::BadRequest(
                "index is already trained; rebuild requires a fresh index".into(),
            ));
        }
        if ids.is_empty() {
            return Err(DannError::BadRequest("cannot build from empty input".into()));
        }
        if vectors.len() != ids.len() * self.dim {
            return Err(DannError::BadRequest(format!(
                "vector buffer length {} does not match {} ids of dim {}",
                vectors.len(),
                ids.len(),
                self.dim
            )));
        }

        let n = ids.len();
        let nlist = self.nlist_override.unwrap_or_else(|| default_nlist(n)).clamp(1, n);

        info!(
            name = %self.name,
            n = n,
            dim = self.dim,
            nlist = nlist,
            shards = self.shard_count,
            "building IVF index"
        );

        // Train on a bounded sample of the input.
        let sample = self.kmeans.sample_training_set(vectors, self.dim, nlist);
        let trained = kmeans::train(self.dim, nlist, &sample, &self.kmeans)?;
        self.centroids = trained.centroids;
        self.centroid_ids = (0..nlist as i64).collect();

        // Assign every input vector to its nearest centroid.
        let mut lists: Vec<InvertedList> = (0..nlist).map(|_| InvertedList::new()).collect();
        for (i, vector) in vectors.chunks_exact(self.dim).enumerate() {
            let c = find_closest(&self.centroids, vector, self.dim);
            lists[c].push(ids[i], vector);
        }

        // Posting list for centroid c lives on shard c mod shard_count.
        for (c, list) in lists.into_iter().enumerate() {
            let shard = self.shard_for_centroid(c as i64);
            debug!(centroid = c, shard = shard, members = list.len(), "distributing posting");
            self.shards[shard as usize]
                .write()
                .map_err(|_| DannError::Internal("shard lock poisoned".into()))?
                .add_posting(c as i64, list);
        }

        self.trained = true;
        self.ntotal = n;
        info!(name = %self.name, nlist = nlist, ntotal = n, "IVF build complete");
        Ok(())
    }

    /// Appends one vector to its nearest centroid's posting list.
    ///
    /// Only valid after training; incremental growth never re-clusters.
    pub fn insert(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        if !self.trained {
            return Err(DannError::NotTrained);
        }
        if vector.len() != self.dim {
            return Err(DannError::dimension_mismatch(self.dim, vector.len()));
        }
        let c = find_closest(&self.centroids, vector, self.dim) as i64;
        let shard = self.shard_for_centroid(c);
        self.shards[shard as usize]
            .write()
            .map_err(|_| DannError::Internal("shard lock poisoned".into()))?
            .push(c, id, vector);
        self.ntotal += 1;
        Ok(())
    }

    /// Removes `id` from whichever posting list holds it.
    pub fn remove(&mut self, id: VectorId) -> bool {
        for shard in &self.shards {
            let mut guard = match shard.write() {
                Ok(g) => g,
                Err(_) => continue,
            };
            if guard.remove(id) {
                self.ntotal -= 1;
                return true;
            }
        }
        false
    }

    /// Looks up the stored vector for `id`.
    pub fn get(&self, id: VectorId) -> Option<Vec<f32>> {
        for shard in &self.shards {
            let guard = shard.read().ok()?;
            if let Some(v) = guard.get(id) {
                return Some(v.to_vec());
            }
        }
        None
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.get(id).is_some()
    }

    /// Probe-based search with the configured default probe count.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search_with_nprobe(query, k, self.nprobe)
    }

    /// Probe-based search.
    ///
    /// Ranks all centroids by distance to the query, takes the closest
    /// `nprobe` (clamped to `[1, nlist]`), groups them by owning shard, and
    /// merges the per-shard partials by `(distance, id)` so the result is
    /// independent of shard scheduling.
    pub fn search_with_nprobe(
        &self,
        query: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchResult>> {
        if !self.trained {
            return Err(DannError::NotTrained);
        }
        if query.len() != self.dim {
            return Err(DannError::dimension_mismatch(self.dim, query.len()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let nlist = self.nlist();
        let nprobe = nprobe.clamp(1, nlist);

        // Rank centroids ascending by distance, ties to the lower id.
        let mut ranked: Vec<(OrderedFloat<f32>, i64)> = self
            .centroids
            .chunks_exact(self.dim)
            .zip(&self.centroid_ids)
            .map(|(centroid, &c)| (OrderedFloat(l2_distance(centroid, query)), c))
            .collect();
        ranked.sort_unstable();

        // Group the selected probes by owning shard; a BTreeMap fixes the
        // scan order so merges are reproducible.
        let mut probes_by_shard: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
        for &(_, c) in ranked.iter().take(nprobe) {
            probes_by_shard
                .entry(self.shard_for_centroid(c))
                .or_default()
                .push(c);
        }

        let mut partials: Vec<SearchResult> = Vec::new();
        for (shard_id, probes) in &probes_by_shard {
            let guard = self.shards[*shard_id as usize]
                .read()
                .map_err(|_| DannError::Internal("shard lock poisoned".into()))?;
            partials.extend(guard.search(probes, query, k));
        }

        Ok(rank_results(partials, k))
    }
}

impl std::fmt::Debug for DistributedIvfIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedIvfIndex")
            .field("name", &self.name)
            .field("dim", &self.dim)
            .field("nlist", &self.nlist())
            .field("shard_count", &self.shard_count)
            .field("trained", &self.trained)
            .field("ntotal", &self.ntotal)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
