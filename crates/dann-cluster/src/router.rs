//! Query router: fans a query across the cluster, merges partial results,
//! caches frequent queries, and degrades gracefully on node failure.

use crate::balancer::LoadBalancer;
use crate::cache::{CacheStats, QueryCache};
use crate::membership::ClusterView;
use crate::metrics::MetricsRegistry;
use dann_core::{NodeInfo, QueryRequest, QueryResponse, Result, SearchResult};
use dann_index::{merge_deduplicated, LocalVectorIndex};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Remote shard search, implemented by the RPC client pool.
pub trait QueryTransport: Send + Sync {
    fn shard_search<'a>(
        &'a self,
        node: &'a NodeInfo,
        query: &'a [f32],
        k: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SearchResult>>> + Send + 'a>>;
}

/// What to do when a target node cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Retry the node's shards on a replica before giving up on them.
    #[default]
    RetryReplicas,
    /// Skip the node and mark the response partial.
    PartialResults,
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_size: 10_000,
            cache_ttl: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Aggregate router metrics.
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub avg_response_time_ms: f64,
    pub node_query_counts: HashMap<String, u64>,
    pub node_response_times: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_queries: u64,
    successful_queries: u64,
    failed_queries: u64,
    total_response_time_ms: u64,
    node_query_counts: HashMap<String, u64>,
    node_time_sums_ms: HashMap<String, u64>,
}

/// Fans queries out to the cluster and merges the partials.
pub struct QueryRouter {
    cluster: Arc<dyn ClusterView>,
    transport: Arc<dyn QueryTransport>,
    balancer: Arc<dyn LoadBalancer>,
    local_node_id: String,
    local_index: Option<Arc<LocalVectorIndex>>,
    cache: Mutex<QueryCache>,
    metrics: Mutex<MetricsInner>,
    /// Node-level registry fed with cache hit/miss counts.
    registry: Option<Arc<MetricsRegistry>>,
    config: RouterConfig,
}

impl QueryRouter {
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        transport: Arc<dyn QueryTransport>,
        balancer: Arc<dyn LoadBalancer>,
        local_node_id: impl Into<String>,
        local_index: Option<Arc<LocalVectorIndex>>,
        config: RouterConfig,
    ) -> Self {
        let cache = QueryCache::new(config.cache_size, config.cache_ttl);
        Self {
            cluster,
            transport,
            balancer,
            local_node_id: local_node_id.into(),
            local_index,
            cache: Mutex::new(cache),
            metrics: Mutex::new(MetricsInner::default()),
            registry: None,
            config,
        }
    }

    /// Forwards cache hit/miss counts to the node's metrics registry.
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Nodes a query should visit. All active nodes is always a correct
    /// answer; a centroid-locality pruning can narrow this later as long as
    /// it never drops a node whose shards own relevant probes.
    pub fn select_relevant_nodes(&self, _query: &[f32]) -> Vec<NodeInfo> {
        self.cluster.active_nodes()
    }

    /// Picks one node among `candidates` with the active balance strategy.
    pub fn select_node(&self, candidates: &[String], query: &[f32]) -> Option<String> {
        self.balancer.select(candidates, query)
    }

    /// Executes a query end to end. Errors are encoded in the response;
    /// this never panics the caller with a transport failure.
    pub async fn execute(&self, request: &QueryRequest) -> QueryResponse {
        let start = Instant::now();

        if request.query.is_empty() {
            return self.finish_failure(QueryResponse::failure("empty query vector"));
        }
        if request.k == 0 {
            // k = 0 is a trivially satisfied query.
            return self.finish_success(QueryResponse::ok(Vec::new(), 0), false);
        }

        // 1. Cache probe.
        if self.config.cache_enabled {
            let cached = {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.get(&request.query, request.k)
            };
            if let Some(results) = cached {
                if let Some(registry) = &self.registry {
                    registry.record_cache_hit();
                }
                debug!(k = request.k, "query served from cache");
                return self.finish_success(
                    QueryResponse::ok(results, start.elapsed().as_millis() as u64),
                    false,
                );
            }
            if let Some(registry) = &self.registry {
                registry.record_cache_miss();
            }
        }

        // 2. Target selection.
        let targets = self.select_relevant_nodes(&request.query);
        if targets.is_empty() {
            return self.finish_failure(QueryResponse::failure("no active nodes"));
        }

        // 3. Fan out, bounded by the request timeout.
        let timeout = Duration::from_millis(request.timeout_ms.max(1));
        let fan_out = futures::future::join_all(
            targets
                .iter()
                .map(|node| self.query_target(node, &targets, request, timeout)),
        );
        let outcomes = match tokio::time::timeout(timeout, fan_out).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                warn!(timeout_ms = request.timeout_ms, "query timed out across all targets");
                return self.finish_failure(QueryResponse::failure(format!(
                    "query timed out after {} ms",
                    request.timeout_ms
                )));
            }
        };

        // 4. Merge.
        let mut partials = Vec::new();
        let mut failed_nodes = 0usize;
        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(results) => partials.push(results),
                Err(e) => {
                    warn!(node = %node_id, error = %e, "target node failed");
                    failed_nodes += 1;
                }
            }
        }

        if partials.is_empty() {
            return self.finish_failure(QueryResponse::failure("all target nodes failed"));
        }

        let results = merge_deduplicated(partials, request.k);
        let mut response = QueryResponse::ok(results, start.elapsed().as_millis() as u64);
        response.partial = failed_nodes > 0;

        // 5-6. Metrics and cache fill. Partial answers are not cached; a
        // later query may do better once the node recovers.
        if self.config.cache_enabled && !response.partial {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(&request.query, request.k, response.results.clone());
        }
        self.finish_success(response, failed_nodes > 0)
    }

    /// Queries one target, retrying on replicas per the failure policy.
    /// Returns the target's node id alongside the outcome for metrics.
    async fn query_target(
        &self,
        node: &NodeInfo,
        all_targets: &[NodeInfo],
        request: &QueryRequest,
        timeout: Duration,
    ) -> (String, Result<Vec<SearchResult>>) {
        let started = Instant::now();
        let mut result = self.query_one(node, request, timeout).await;

        if result.is_err() {
            self.balancer.mark_unhealthy(&node.node_id);
            if self.config.failure_policy == FailurePolicy::RetryReplicas {
                result = self
                    .retry_on_replicas(node, all_targets, request, timeout, result)
                    .await;
            }
        } else {
            self.balancer.mark_healthy(&node.node_id);
        }

        let elapsed = started.elapsed();
        self.balancer.record_latency(&node.node_id, elapsed);
        self.record_node_attempt(&node.node_id, elapsed);
        (node.node_id.clone(), result)
    }

    async fn retry_on_replicas(
        &self,
        failed: &NodeInfo,
        all_targets: &[NodeInfo],
        request: &QueryRequest,
        timeout: Duration,
        mut last: Result<Vec<SearchResult>>,
    ) -> Result<Vec<SearchResult>> {
        let replicas = self.replicas_for(failed, all_targets);
        if replicas.is_empty() {
            return last;
        }

        let mut backoff = self.config.retry_backoff;
        for _attempt in 0..self.config.max_retries {
            let Some(pick) = self.balancer.select(&replicas, &request.query) else {
                break;
            };
            let Some(replica) = self.cluster.node(&pick) else {
                break;
            };
            debug!(failed = %failed.node_id, replica = %pick, "retrying on replica");
            match self.query_one(&replica, request, timeout).await {
                Ok(results) => {
                    self.balancer.mark_healthy(&pick);
                    return Ok(results);
                }
                Err(e) => {
                    self.balancer.mark_unhealthy(&pick);
                    last = Err(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        last
    }

    /// Replica candidates for a failed node: active nodes sharing at least
    /// one of its shards, or every other active node when shard
    /// assignments are not tracked.
    fn replicas_for(&self, failed: &NodeInfo, all_targets: &[NodeInfo]) -> Vec<String> {
        let sharing: Vec<String> = all_targets
            .iter()
            .filter(|n| n.node_id != failed.node_id)
            .filter(|n| {
                failed.shard_ids.is_empty()
                    || n.shard_ids.iter().any(|s| failed.shard_ids.contains(s))
            })
            .map(|n| n.node_id.clone())
            .collect();
        sharing
    }

    async fn query_one(
        &self,
        node: &NodeInfo,
        request: &QueryRequest,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>> {
        if node.node_id == self.local_node_id {
            if let Some(index) = &self.local_index {
                return index.search(&request.query, request.k);
            }
        }
        match tokio::time::timeout(
            timeout,
            self.transport.shard_search(node, &request.query, request.k),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(dann_core::DannError::Timeout(timeout.as_millis() as u64)),
        }
    }

    // =========================================================================
    // Metrics and cache accessors
    // =========================================================================

    fn record_node_attempt(&self, node_id: &str, elapsed: Duration) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        *metrics.node_query_counts.entry(node_id.to_string()).or_insert(0) += 1;
        *metrics.node_time_sums_ms.entry(node_id.to_string()).or_insert(0) +=
            elapsed.as_millis() as u64;
    }

    fn finish_success(&self, response: QueryResponse, partial: bool) -> QueryResponse {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.total_queries += 1;
        metrics.successful_queries += 1;
        metrics.total_response_time_ms += response.query_time_ms;
        drop(metrics);
        if partial {
            debug!("returning partial results");
        }
        response
    }

    fn finish_failure(&self, response: QueryResponse) -> QueryResponse {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.total_queries += 1;
        metrics.failed_queries += 1;
        response
    }

    pub fn metrics(&self) -> QueryMetrics {
        let inner = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let avg = if inner.successful_queries > 0 {
            inner.total_response_time_ms as f64 / inner.successful_queries as f64
        } else {
            0.0
        };
        QueryMetrics {
            total_queries: inner.total_queries,
            successful_queries: inner.successful_queries,
            failed_queries: inner.failed_queries,
            avg_response_time_ms: avg,
            node_query_counts: inner.node_query_counts.clone(),
            node_response_times: inner
                .node_time_sums_ms
                .iter()
                .map(|(node, &sum)| {
                    let count = inner.node_query_counts.get(node).copied().unwrap_or(1).max(1);
                    (node.clone(), sum as f64 / count as f64)
                })
                .collect(),
        }
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner()) = MetricsInner::default();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
            .clone()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("local_node", &self.local_node_id)
            .field("cache_enabled", &self.config.cache_enabled)
            .field("failure_policy", &self.config.failure_policy)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{make_balancer, BalanceStrategy};
    use crate::membership::NodeManager;
    use dann_core::{DannError, IndexType, NodeInfo, VectorId};
    use dann_index::IvfConfig;

    /// Transport that serves canned per-node results or failures.
    struct FakeTransport {
        answers: HashMap<String, Vec<SearchResult>>,
        failing: std::collections::HashSet<String>,
    }

    impl QueryTransport for FakeTransport {
        fn shard_search<'a>(
            &'a self,
            node: &'a NodeInfo,
            _query: &'a [f32],
            _k: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<SearchResult>>> + Send + 'a>> {
            let outcome = if self.failing.contains(&node.node_id) {
                Err(DannError::Transient(format!("{} unreachable", node.node_id)))
            } else {
                Ok(self.answers.get(&node.node_id).cloned().unwrap_or_default())
            };
            Box::pin(async move { outcome })
        }
    }

    fn local_index() -> Arc<LocalVectorIndex> {
        let index = LocalVectorIndex::new(IndexType::Flat, IvfConfig::new(2)).unwrap();
        index
            .add_vectors(&[0.0, 0.0, 3.0, 4.0], &[VectorId(1), VectorId(2)])
            .unwrap();
        Arc::new(index)
    }

    fn router_with(
        manager: Arc<NodeManager>,
        transport: FakeTransport,
        index: Option<Arc<LocalVectorIndex>>,
    ) -> QueryRouter {
        QueryRouter::new(
            manager,
            Arc::new(transport),
            make_balancer(BalanceStrategy::RoundRobin),
            "n1",
            index,
            RouterConfig {
                retry_backoff: Duration::from_millis(1),
                ..RouterConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_local_only_query() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: Default::default(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        let response = router.execute(&QueryRequest::new(vec![0.0, 0.0], 2)).await;
        assert!(response.success);
        assert!(!response.partial);
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].id, VectorId(1));
    }

    #[tokio::test]
    async fn test_merge_across_nodes_dedups() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));

        let mut answers = HashMap::new();
        // n2 returns an overlapping id at a worse distance plus a new one.
        answers.insert(
            "n2".to_string(),
            vec![
                SearchResult::new(VectorId(1), 9.0),
                SearchResult::new(VectorId(7), 1.0),
            ],
        );
        let transport = FakeTransport {
            answers,
            failing: Default::default(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        let response = router.execute(&QueryRequest::new(vec![0.0, 0.0], 3)).await;
        assert!(response.success);
        let ids: Vec<VectorId> = response.results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![VectorId(1), VectorId(7), VectorId(2)]);
        // Deduplicated id 1 kept its best distance.
        assert_eq!(response.results[0].distance, 0.0);
    }

    #[tokio::test]
    async fn test_node_failure_gives_partial() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));

        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: ["n2".to_string()].into_iter().collect(),
        };
        let router = QueryRouter::new(
            manager,
            Arc::new(transport),
            make_balancer(BalanceStrategy::RoundRobin),
            "n1",
            Some(local_index()),
            RouterConfig {
                failure_policy: FailurePolicy::PartialResults,
                ..RouterConfig::default()
            },
        );

        let response = router.execute(&QueryRequest::new(vec![0.0, 0.0], 2)).await;
        // The remaining replica covered the query: success, flagged partial,
        // and failed_queries stays at zero.
        assert!(response.success);
        assert!(response.partial);
        assert!(!response.results.is_empty());
        assert_eq!(router.metrics().failed_queries, 0);
        assert_eq!(router.metrics().successful_queries, 1);
    }

    #[tokio::test]
    async fn test_node_failure_recovers_on_replica() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));

        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: ["n2".to_string()].into_iter().collect(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        // With RetryReplicas the failed node's shards are re-served by the
        // surviving replica and the answer is complete.
        let response = router.execute(&QueryRequest::new(vec![0.0, 0.0], 2)).await;
        assert!(response.success);
        assert!(!response.partial);
        assert_eq!(router.metrics().failed_queries, 0);
    }

    #[tokio::test]
    async fn test_all_nodes_failed() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: ["n1".to_string()].into_iter().collect(),
        };
        // No local index: the local target goes through the failing transport.
        let router = router_with(manager, transport, None);

        let response = router.execute(&QueryRequest::new(vec![0.0, 0.0], 2)).await;
        assert!(!response.success);
        assert!(response.results.is_empty());
        assert_eq!(router.metrics().failed_queries, 1);
    }

    #[tokio::test]
    async fn test_k_zero_is_empty_success() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: Default::default(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        let response = router.execute(&QueryRequest::new(vec![0.0, 0.0], 0)).await;
        assert!(response.success);
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: Default::default(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        let request = QueryRequest::new(vec![0.0, 0.0], 2);
        let first = router.execute(&request).await;
        assert_eq!(router.cache_stats().misses, 1);
        let second = router.execute(&request).await;
        assert_eq!(router.cache_stats().hits, 1);
        assert_eq!(first.results, second.results);
    }

    #[tokio::test]
    async fn test_cache_counters_reach_registry() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: Default::default(),
        };
        let registry = Arc::new(crate::metrics::MetricsRegistry::new().unwrap());
        let router = router_with(manager, transport, Some(local_index()))
            .with_metrics(Arc::clone(&registry));

        let request = QueryRequest::new(vec![0.0, 0.0], 2);
        router.execute(&request).await;
        // One miss, no hits yet.
        assert_eq!(registry.cache_hit_rate(), 0.0);

        router.execute(&request).await;
        // One miss plus one hit.
        assert!((registry.cache_hit_rate() - 0.5).abs() < 1e-9);

        let exported = registry.export().unwrap();
        assert!(exported.contains("dann_cache_hits_total 1"));
        assert!(exported.contains("dann_cache_misses_total 1"));
    }

    #[tokio::test]
    async fn test_metrics_track_nodes() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: Default::default(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        router.execute(&QueryRequest::new(vec![0.0, 0.0], 1)).await;
        let metrics = router.metrics();
        assert_eq!(metrics.total_queries, 1);
        assert_eq!(metrics.node_query_counts.get("n1"), Some(&1));

        router.reset_metrics();
        assert_eq!(router.metrics().total_queries, 0);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let manager = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let transport = FakeTransport {
            answers: HashMap::new(),
            failing: Default::default(),
        };
        let router = router_with(manager, transport, Some(local_index()));

        let response = router.execute(&QueryRequest::new(vec![], 2)).await;
        assert!(!response.success);
        assert_eq!(router.metrics().failed_queries, 1);
    }
}
