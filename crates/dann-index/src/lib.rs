//! # DANN Index
//!
//! The indexing core of the DANN distributed vector index:
//!
//! - [`distance`] - Squared-L2 kernel, argmin and bounded top-k
//! - [`kmeans`] - Deterministic Lloyd's trainer for IVF centroids
//! - [`ivf`] - Inverted lists, shards and the distributed IVF coordinator
//! - [`flat`] - Exact brute-force baseline
//! - [`backend`] - The closed set of index engines
//! - [`local`] - The per-shard container with version tracking
//! - [`persist`] - Self-describing on-disk index format

pub mod backend;
pub mod distance;
pub mod flat;
pub mod ivf;
pub mod kmeans;
pub mod local;
pub mod persist;

pub use backend::IndexBackend;
pub use distance::{find_closest, l2_distance, merge_deduplicated, rank_results, TopK};
pub use flat::FlatIndex;
pub use ivf::{default_nlist, DistributedIvfIndex, InvertedList, IvfConfig, IvfShard};
pub use kmeans::{KmeansParams, KmeansResult};
pub use local::LocalVectorIndex;
