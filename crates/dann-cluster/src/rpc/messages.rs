//! Wire shapes for the vector-search service.

use dann_core::{ConsistencyLevel, IndexOperation, SearchResult, VectorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One vector in an AddVectors request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: VectorId,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Vec<f32>,
    pub k: i32,
    pub consistency_level: ConsistencyLevel,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub success: bool,
    pub error: String,
    pub query_time_ms: u64,
    pub results: Vec<SearchResult>,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddVectorsRequest {
    pub vectors: Vec<VectorEntry>,
    pub batch_size: i32,
    pub overwrite_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddVectorsResponse {
    pub success: bool,
    pub added_count: u64,
    pub load_time_ms: u64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_vectors: u64,
    pub index_type: String,
    pub dimension: i32,
    pub total_queries: u64,
    pub avg_query_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub details: HashMap<String, String>,
}

/// Every method carried over the framed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Cluster-wide query, fanned out by the receiving node's router.
    Search(SearchRequest),
    /// Shard-scoped scan of the receiving node's local index only; used by
    /// routers fanning out, never re-fanned.
    ShardSearch { query: Vec<f32>, k: u32 },
    AddVectors(AddVectorsRequest),
    RemoveVector { id: VectorId },
    UpdateVector { id: VectorId, vector: Vec<f32> },
    GetStats,
    HealthCheck,
    /// Replication push from a peer's consistency manager.
    ApplyOperation(IndexOperation),
    /// Anti-entropy exchange: the sender's per-vector versions; the reply
    /// carries operations for every vector the receiver is ahead on.
    SyncVersions { versions: HashMap<i64, u64> },
    /// Membership heartbeat.
    Heartbeat { node_id: String, address: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    Search(SearchResponse),
    ShardSearch { success: bool, error: String, results: Vec<SearchResult> },
    AddVectors(AddVectorsResponse),
    Ack { success: bool, error: String },
    Stats(StatsResponse),
    Health(HealthResponse),
    Operations(Vec<IndexOperation>),
}

// =============================================================================
// Tests
// =============================================================================
