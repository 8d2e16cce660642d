//! # DANN Cluster
//!
//! The distributed service layer of the DANN vector index:
//!
//! - [`membership`] - Node table, heartbeats, failure detection
//! - [`consistency`] - Vector clocks, replication queue, anti-entropy
//! - [`loader`] - Bulk-load pipeline with progress and retry
//! - [`router`] - Query fan-out, merge, cache and failover
//! - [`cache`] / [`balancer`] - Query cache and balancing strategies
//! - [`rpc`] - Length-prefixed binary RPC surface
//! - [`config`] / [`logging`] / [`metrics`] - Node-level plumbing

pub mod balancer;
pub mod cache;
pub mod config;
pub mod consistency;
pub mod loader;
pub mod logging;
pub mod membership;
pub mod metrics;
pub mod router;
pub mod rpc;

pub use balancer::{make_balancer, BalanceStrategy, LoadBalancer};
pub use cache::{CacheStats, QueryCache};
pub use config::DannConfig;
pub use consistency::{
    ConflictStrategy, ConsistencyConfig, ConsistencyManager, ReplicationTransport,
};
pub use loader::{
    BulkLoader, ErrorStrategy, LoadHandle, LoadMetrics, LoadProgress, LoadStatus, LoaderConfig,
};
pub use membership::{ClusterView, NodeManager};
pub use metrics::MetricsRegistry;
pub use router::{FailurePolicy, QueryMetrics, QueryRouter, QueryTransport, RouterConfig};
pub use rpc::{RpcClient, RpcClientPool, RpcServer};
