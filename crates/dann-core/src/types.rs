//! Shared data model: search results, mutation operations, requests and
//! responses, node descriptors.

use crate::{VectorClock, VectorId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Search results
// =============================================================================

/// A single nearest-neighbor match.
///
/// `distance` is the squared L2 distance to the query (no square root is
/// taken anywhere in the engine; monotone is sufficient for ordering).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matched vector id.
    pub id: VectorId,
    /// Squared L2 distance to the query.
    pub distance: f32,
    /// The matched vector itself, when the caller asked for payloads.
    pub vector: Option<Vec<f32>>,
}

impl SearchResult {
    /// Creates a result without a vector payload.
    pub fn new(id: VectorId, distance: f32) -> Self {
        Self {
            id,
            distance,
            vector: None,
        }
    }
}

// =============================================================================
// Mutation operations
// =============================================================================

/// The kind of a replicated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Delete,
    Update,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Add => write!(f, "add"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::Update => write!(f, "update"),
        }
    }
}

/// A mutation record fed to the consistency layer and replicated to peers.
///
/// The operation identifier `origin:id:version` is unique across the
/// cluster: `version` is monotonic per index and `origin` names the node
/// that accepted the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOperation {
    pub kind: OperationKind,
    pub id: VectorId,
    /// Vector payload; present for Add and Update, absent for Delete.
    pub vector: Option<Vec<f32>>,
    /// Milliseconds since the Unix epoch at which the write was accepted.
    pub timestamp_ms: u64,
    /// Index version at which the write was recorded.
    pub version: u64,
    /// Node that accepted the write.
    pub origin: String,
    /// Causality clock, when the origin tracks one.
    pub clock: Option<VectorClock>,
}

impl IndexOperation {
    pub fn new(kind: OperationKind, id: VectorId, timestamp_ms: u64, version: u64) -> Self {
        Self {
            kind,
            id,
            vector: None,
            timestamp_ms,
            version,
            origin: String::new(),
            clock: None,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// The cluster-unique operation identifier.
    pub fn operation_id(&self) -> String {
        format!("{}:{}:{}", self.origin, self.id, self.version)
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Consistency level requested by a query. Only eventual consistency is
/// offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    #[default]
    Eventual,
}

/// A k-NN query as accepted at the ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: Vec<f32>,
    pub k: usize,
    pub consistency_level: ConsistencyLevel,
    pub timeout_ms: u64,
}

impl QueryRequest {
    pub fn new(query: Vec<f32>, k: usize) -> Self {
        Self {
            query,
            k,
            consistency_level: ConsistencyLevel::Eventual,
            timeout_ms: 5000,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// The answer to a [`QueryRequest`].
///
/// `success = false` implies `results` is empty. `partial = true` marks a
/// degraded answer where at least one target node could not be reached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub success: bool,
    pub error: String,
    pub results: Vec<SearchResult>,
    pub query_time_ms: u64,
    pub partial: bool,
}

impl QueryResponse {
    pub fn ok(results: Vec<SearchResult>, query_time_ms: u64) -> Self {
        Self {
            success: true,
            error: String::new(),
            results,
            query_time_ms,
            partial: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            results: Vec::new(),
            query_time_ms: 0,
            partial: false,
        }
    }
}

// =============================================================================
// Bulk loading
// =============================================================================

/// A bulk ingest request: `ids.len()` vectors flattened into `vectors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkLoadRequest {
    /// Flat buffer of `ids.len() * dim` floats.
    pub vectors: Vec<f32>,
    pub ids: Vec<VectorId>,
    pub batch_size: usize,
    pub overwrite_existing: bool,
}

impl BulkLoadRequest {
    pub fn new(vectors: Vec<f32>, ids: Vec<VectorId>) -> Self {
        Self {
            vectors,
            ids,
            batch_size: 1000,
            overwrite_existing: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

// =============================================================================
// Cluster nodes
// =============================================================================

/// Descriptor for one cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub port: u16,
    pub is_active: bool,
    /// Milliseconds since the Unix epoch of the last heartbeat.
    pub last_heartbeat_ms: u64,
    /// Shards assigned to this node.
    pub shard_ids: Vec<u32>,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            port,
            is_active: false,
            last_heartbeat_ms: 0,
            shard_ids: Vec::new(),
        }
    }

    /// `host:port` endpoint for the RPC channel.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Index backends
// =============================================================================

/// The closed set of index backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexType {
    Flat,
    #[default]
    Ivf,
    Hnsw,
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::Flat => write!(f, "Flat"),
            IndexType::Ivf => write!(f, "IVF"),
            IndexType::Hnsw => write!(f, "HNSW"),
        }
    }
}

impl FromStr for IndexType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT" => Ok(IndexType::Flat),
            "IVF" => Ok(IndexType::Ivf),
            "HNSW" => Ok(IndexType::Hnsw),
            other => Err(format!("unknown index type: {other}")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
