//! Prometheus metrics export.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `dann_query_latency_seconds` | Histogram | Query latency distribution |
//! | `dann_query_total` | Counter | Total queries executed |
//! | `dann_cache_hits_total` | Counter | Query cache hits |
//! | `dann_cache_misses_total` | Counter | Query cache misses |
//! | `dann_vectors_total` | Gauge | Vectors in the local index |
//! | `dann_vectors_loaded_total` | Counter | Vectors ingested by bulk loads |
//! | `dann_cluster_node_count` | Gauge | Known cluster nodes |
//! | `dann_cluster_healthy_nodes` | Gauge | Active cluster nodes |
//! | `dann_pending_replications` | Gauge | Operations awaiting replication |

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::Duration;

/// Error type for metrics operations.
#[derive(Debug)]
pub struct MetricsError(String);

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetricsError: {}", self.0)
    }
}

impl std::error::Error for MetricsError {}

impl From<prometheus::Error> for MetricsError {
    fn from(e: prometheus::Error) -> Self {
        MetricsError(e.to_string())
    }
}

/// Metrics registry for a DANN node. Constructed explicitly and shared by
/// reference; there is no global registry.
pub struct MetricsRegistry {
    registry: Registry,
    query_latency: Histogram,
    query_count: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    vector_count: IntGauge,
    vectors_loaded: IntCounter,
    cluster_node_count: IntGauge,
    cluster_healthy_nodes: IntGauge,
    pending_replications: IntGauge,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let query_latency = Histogram::with_opts(
            HistogramOpts::new("dann_query_latency_seconds", "Query latency in seconds").buckets(
                vec![
                    0.0001, // 100μs
                    0.0005, // 500μs
                    0.001,  // 1ms
                    0.005,  // 5ms
                    0.01,   // 10ms
                    0.05,   // 50ms
                    0.1,    // 100ms
                    0.5,    // 500ms
                    1.0,    // 1s
                    5.0,    // 5s
                ],
            ),
        )?;
        let query_count = IntCounter::new("dann_query_total", "Total queries executed")?;
        let cache_hits = IntCounter::new("dann_cache_hits_total", "Query cache hits")?;
        let cache_misses = IntCounter::new("dann_cache_misses_total", "Query cache misses")?;
        let vector_count = IntGauge::new("dann_vectors_total", "Vectors in the local index")?;
        let vectors_loaded =
            IntCounter::new("dann_vectors_loaded_total", "Vectors ingested by bulk loads")?;
        let cluster_node_count =
            IntGauge::new("dann_cluster_node_count", "Known cluster nodes")?;
        let cluster_healthy_nodes =
            IntGauge::new("dann_cluster_healthy_nodes", "Active cluster nodes")?;
        let pending_replications = IntGauge::new(
            "dann_pending_replications",
            "Operations awaiting replication",
        )?;

        registry.register(Box::new(query_latency.clone()))?;
        registry.register(Box::new(query_count.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(vector_count.clone()))?;
        registry.register(Box::new(vectors_loaded.clone()))?;
        registry.register(Box::new(cluster_node_count.clone()))?;
        registry.register(Box::new(cluster_healthy_nodes.clone()))?;
        registry.register(Box::new(pending_replications.clone()))?;

        Ok(Self {
            registry,
            query_latency,
            query_count,
            cache_hits,
            cache_misses,
            vector_count,
            vectors_loaded,
            cluster_node_count,
            cluster_healthy_nodes,
            pending_replications,
        })
    }

    pub fn record_query_latency(&self, duration: Duration) {
        self.query_latency.observe(duration.as_secs_f64());
        self.query_count.inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn set_vector_count(&self, count: i64) {
        self.vector_count.set(count);
    }

    pub fn record_vectors_loaded(&self, count: u64) {
        self.vectors_loaded.inc_by(count);
    }

    pub fn set_cluster_node_count(&self, count: usize) {
        self.cluster_node_count.set(count as i64);
    }

    pub fn set_cluster_healthy_nodes(&self, count: usize) {
        self.cluster_healthy_nodes.set(count as i64);
    }

    pub fn set_pending_replications(&self, count: usize) {
        self.pending_replications.set(count as i64);
    }

    /// Cache hit rate in `[0, 1]`.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get() as f64;
        let misses = self.cache_misses.get() as f64;
        let total = hits + misses;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("query_count", &self.query_count.get())
            .field("cache_hits", &self.cache_hits.get())
            .field("cache_misses", &self.cache_misses.get())
            .field("vector_count", &self.vector_count.get())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
