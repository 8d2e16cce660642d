//! Unified node configuration.
//!
//! Priority, highest first: `DANN_*` environment variables, a TOML
//! configuration file, built-in defaults. The config is an explicitly
//! constructed value passed by reference; there is no process-wide
//! singleton.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration for a DANN node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DannConfig {
    pub node: NodeConfig,
    pub index: IndexConfig,
    pub performance: PerformanceConfig,
    pub network: NetworkConfig,
}

impl DannConfig {
    /// Loads configuration from an optional file path with environment
    /// variable overrides applied on top.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `DANN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DANN_NODE_ID") {
            self.node.id = val;
        }
        if let Ok(val) = std::env::var("DANN_NODE_ADDRESS") {
            self.node.address = val;
        }
        if let Ok(val) = std::env::var("DANN_NODE_PORT") {
            if let Ok(v) = val.parse() {
                self.node.port = v;
            }
        }
        if let Ok(val) = std::env::var("DANN_INDEX_DIMENSION") {
            if let Ok(v) = val.parse() {
                self.index.dimension = v;
            }
        }
        if let Ok(val) = std::env::var("DANN_INDEX_TYPE") {
            self.index.index_type = val;
        }
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Node identity and cluster seeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Port for the framed RPC listener.
    pub grpc_port: u16,
    /// `host:port` seed endpoints to join on startup.
    pub seed_nodes: Vec<String>,
    pub replication_factor: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            address: "127.0.0.1".to_string(),
            port: 7000,
            grpc_port: 7001,
            seed_nodes: Vec::new(),
            replication_factor: 3,
        }
    }
}

/// Index shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dimension: usize,
    /// `Flat`, `IVF` or `HNSW`.
    pub index_type: String,
    /// Centroid count; zero derives it from the corpus size.
    pub nlist: usize,
    /// Default probe count per query.
    pub nprobe: usize,
    /// Shards the posting lists are spread across.
    pub shard_count: u32,
    /// Path for save/load of the index file.
    pub storage_path: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            index_type: "IVF".to_string(),
            nlist: 0,
            nprobe: 8,
            shard_count: 4,
            storage_path: "data/index.dann".to_string(),
        }
    }
}

/// Throughput and caching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub batch_size: usize,
    pub max_concurrent_loads: usize,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub query_timeout_ms: u64,
    pub load_timeout_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent_loads: 4,
            cache_enabled: true,
            cache_size: 10_000,
            query_timeout_ms: 5000,
            load_timeout_ms: 30_000,
        }
    }
}

/// Transport behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connection_timeout_ms: u64,
    pub max_retries: usize,
    /// `round_robin`, `least_loaded` or `hash_based`.
    pub load_balance_strategy: String,
    /// Heartbeat silence after which a node counts as failed.
    pub heartbeat_failure_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5000,
            max_retries: 3,
            load_balance_strategy: "round_robin".to_string(),
            heartbeat_failure_ms: 30_000,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
