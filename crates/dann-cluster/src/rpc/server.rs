//! RPC server: accepts framed connections and serves the vector-search
//! surface plus the internal consistency exchanges.

use super::codec::{read_frame, write_frame};
use super::messages::*;
use crate::consistency::ConsistencyManager;
use crate::loader::{BulkLoader, LoadStatus};
use crate::membership::{ClusterView, NodeManager};
use crate::metrics::MetricsRegistry;
use crate::router::QueryRouter;
use dann_core::{BulkLoadRequest, DannError, NodeInfo, QueryRequest, Result};
use dann_index::LocalVectorIndex;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Serves the node's RPC surface.
pub struct RpcServer {
    index: Arc<LocalVectorIndex>,
    consistency: Arc<ConsistencyManager>,
    router: Arc<QueryRouter>,
    loader: Arc<BulkLoader>,
    membership: Arc<NodeManager>,
    metrics: Arc<MetricsRegistry>,
    started: Instant,
}

impl RpcServer {
    pub fn new(
        index: Arc<LocalVectorIndex>,
        consistency: Arc<ConsistencyManager>,
        router: Arc<QueryRouter>,
        loader: Arc<BulkLoader>,
        membership: Arc<NodeManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            consistency,
            router,
            loader,
            membership,
            metrics,
            started: Instant::now(),
        })
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Binds `addr` and serves until the membership tracker stops.
    pub async fn bind_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DannError::Internal(format!("failed to bind {addr}: {e}")))?;
        info!(addr = %addr, "rpc server listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| DannError::Internal(format!("accept failed: {e}")))?;
            debug!(peer = %peer, "connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let request: RpcRequest = match read_frame(&mut stream).await {
                Ok(request) => request,
                // EOF or a broken peer ends the connection quietly.
                Err(_) => break,
            };
            let response = self.handle(request).await;
            if let Err(e) = write_frame(&mut stream, &response).await {
                warn!(error = %e, "failed to write response, closing connection");
                break;
            }
        }
    }

    /// Dispatches one request. Public so in-process tests can exercise the
    /// surface without a socket.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Search(req) => RpcResponse::Search(self.search(req).await),
            RpcRequest::ShardSearch { query, k } => self.shard_search(&query, k as usize),
            RpcRequest::AddVectors(req) => RpcResponse::AddVectors(self.add_vectors(req).await),
            RpcRequest::RemoveVector { id } => self.ack(self.remove_vector(id).await),
            RpcRequest::UpdateVector { id, vector } => {
                self.ack(self.update_vector(id, &vector).await)
            }
            RpcRequest::GetStats => RpcResponse::Stats(self.stats()),
            RpcRequest::HealthCheck => RpcResponse::Health(self.health()),
            RpcRequest::ApplyOperation(op) => self.ack(self.apply_operation(op)),
            RpcRequest::SyncVersions { versions } => {
                RpcResponse::Operations(self.consistency.diff_operations(&versions, &self.index))
            }
            RpcRequest::Heartbeat { node_id, address, port } => {
                self.heartbeat(node_id, address, port);
                RpcResponse::Ack { success: true, error: String::new() }
            }
        }
    }

    async fn search(&self, req: SearchRequest) -> SearchResponse {
        if req.k < 0 {
            return SearchResponse {
                success: false,
                error: "k must be non-negative".into(),
                query_time_ms: 0,
                results: Vec::new(),
                partial: false,
            };
        }
        let start = Instant::now();
        let request = QueryRequest {
            query: req.query,
            k: req.k as usize,
            consistency_level: req.consistency_level,
            timeout_ms: req.timeout_ms as u64,
        };
        let response = self.router.execute(&request).await;
        self.metrics.record_query_latency(start.elapsed());
        SearchResponse {
            success: response.success,
            error: response.error,
            query_time_ms: response.query_time_ms,
            results: response.results,
            partial: response.partial,
        }
    }

    fn shard_search(&self, query: &[f32], k: usize) -> RpcResponse {
        match self.index.search(query, k) {
            Ok(results) => RpcResponse::ShardSearch {
                success: true,
                error: String::new(),
                results,
            },
            Err(e) => RpcResponse::ShardSearch {
                success: false,
                error: e.to_string(),
                results: Vec::new(),
            },
        }
    }

    async fn add_vectors(&self, req: AddVectorsRequest) -> AddVectorsResponse {
        let start = Instant::now();
        let dim = self.index.dimension();

        let mut ids = Vec::with_capacity(req.vectors.len());
        let mut vectors = Vec::with_capacity(req.vectors.len() * dim);
        for entry in req.vectors {
            ids.push(entry.id);
            vectors.extend_from_slice(&entry.data);
        }

        let mut request = BulkLoadRequest::new(vectors, ids);
        request.batch_size = req.batch_size.max(1) as usize;
        request.overwrite_existing = req.overwrite_existing;

        match self.loader.load_sync(request).await {
            // Only a clean completion is a success; Failed and Cancelled
            // loads also finish with failed == 0 and must not report one.
            Ok(progress) if progress.status == LoadStatus::Completed => {
                self.metrics.record_vectors_loaded(progress.processed);
                self.metrics.set_vector_count(self.index.size() as i64);
                AddVectorsResponse {
                    success: true,
                    added_count: progress.processed,
                    load_time_ms: start.elapsed().as_millis() as u64,
                    error: String::new(),
                }
            }
            Ok(progress) => AddVectorsResponse {
                success: false,
                added_count: progress.processed,
                load_time_ms: start.elapsed().as_millis() as u64,
                error: format!("load finished {} with {} failures", progress.status, progress.failed),
            },
            Err(e) => AddVectorsResponse {
                success: false,
                added_count: 0,
                load_time_ms: start.elapsed().as_millis() as u64,
                error: e.to_string(),
            },
        }
    }

    async fn remove_vector(&self, id: dann_core::VectorId) -> Result<()> {
        self.index.remove_vector(id)?;
        self.metrics.set_vector_count(self.index.size() as i64);
        self.forward_operations().await;
        Ok(())
    }

    async fn update_vector(&self, id: dann_core::VectorId, vector: &[f32]) -> Result<()> {
        self.index.update_vector(id, vector)?;
        self.forward_operations().await;
        Ok(())
    }

    async fn forward_operations(&self) {
        for op in self.index.take_pending_operations() {
            if let Err(e) = self.consistency.propagate(op).await {
                warn!(error = %e, "failed to enqueue operation for replication");
            }
        }
    }

    fn apply_operation(&self, op: dann_core::IndexOperation) -> Result<()> {
        if self.consistency.accepts(&op) {
            self.index.apply_remote(&op)?;
            self.consistency.apply(&op);
            debug!(op = %op.operation_id(), "applied replicated operation");
        } else {
            debug!(op = %op.operation_id(), "ignored stale replicated operation");
        }
        Ok(())
    }

    fn stats(&self) -> StatsResponse {
        let metrics = self.router.metrics();
        StatsResponse {
            total_vectors: self.index.size() as u64,
            index_type: self.index.index_type().to_string(),
            dimension: self.index.dimension() as i32,
            total_queries: metrics.total_queries,
            avg_query_time_ms: metrics.avg_response_time_ms,
        }
    }

    fn health(&self) -> HealthResponse {
        let mut details = std::collections::HashMap::new();
        details.insert("node_id".into(), self.membership.local_node_id().to_string());
        details.insert("index_type".into(), self.index.index_type().to_string());
        details.insert("vectors".into(), self.index.size().to_string());
        details.insert(
            "pending_replications".into(),
            self.consistency.pending_count().to_string(),
        );
        HealthResponse {
            healthy: true,
            status: "ready".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            uptime_seconds: self.started.elapsed().as_secs(),
            details,
        }
    }

    fn heartbeat(&self, node_id: String, address: String, port: u16) {
        if self.membership.node(&node_id).is_some() {
            self.membership.update_heartbeat(&node_id);
        } else {
            self.membership.register_node(NodeInfo::new(node_id, address, port));
        }
    }

    fn ack(&self, result: Result<()>) -> RpcResponse {
        match result {
            Ok(()) => RpcResponse::Ack { success: true, error: String::new() },
            Err(e) => RpcResponse::Ack { success: false, error: e.to_string() },
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("node", &self.membership.local_node_id())
            .field("uptime", &self.started.elapsed())
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
    use crate::consistency::ConsistencyConfig;
    use crate::loader::LoaderConfig;
    use crate::router::RouterConfig;
    use dann_core::{IndexType, OperationKind, VectorId};
    use dann_index::IvfConfig;

    fn test_server() -> Arc<RpcServer> {
        test_server_with_loader(LoaderConfig::default())
    }

    fn test_server_with_loader(loader_config: LoaderConfig) -> Arc<RpcServer> {
        let index =
            Arc::new(LocalVectorIndex::new(IndexType::Flat, IvfConfig::new(2)).unwrap());
        let membership = Arc::new(NodeManager::new("n1", "127.0.0.1", 7001));
        let consistency = Arc::new(ConsistencyManager::new(ConsistencyConfig::new("n1")));
        let loader = BulkLoader::new(Arc::clone(&index), None, loader_config);
        loader.start_workers();

        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let pool = Arc::new(RpcClientPoolStub);
        let router = Arc::new(
            QueryRouter::new(
                Arc::clone(&membership) as Arc<dyn crate::membership::ClusterView>,
                pool,
                make_balancer(BalanceStrategy::RoundRobin),
                "n1",
                Some(Arc::clone(&index)),
                RouterConfig::default(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        RpcServer::new(index, consistency, router, loader, membership, metrics)
    }

    /// No remote peers in these tests.
    struct RpcClientPoolStub;

    impl crate::router::QueryTransport for RpcClientPoolStub {
        fn shard_search<'a>(
            &'a self,
            _node: &'a NodeInfo,
            _query: &'a [f32],
            _k: usize,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Vec<dann_core::SearchResult>>> + Send + 'a>,
        > {
            Box::pin(async { Err(DannError::Transient("no remotes".into())) })
        }
    }

    fn entries(pairs: &[(i64, [f32; 2])]) -> Vec<VectorEntry> {
        pairs
            .iter()
            .map(|&(id, data)| VectorEntry { id: VectorId(id), data: data.to_vec() })
            .collect()
    }

    #[tokio::test]
    async fn test_add_then_search() {
        let server = test_server();

        let response = server
            .handle(RpcRequest::AddVectors(AddVectorsRequest {
                vectors: entries(&[(1, [0.0, 0.0]), (2, [3.0, 4.0]), (3, [10.0, 10.0])]),
                batch_size: 2,
                overwrite_existing: false,
            }))
            .await;
        match response {
            RpcResponse::AddVectors(r) => {
                assert!(r.success, "{}", r.error);
                assert_eq!(r.added_count, 3);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let response = server
            .handle(RpcRequest::Search(SearchRequest {
                query: vec![0.0, 0.0],
                k: 2,
                consistency_level: Default::default(),
                timeout_ms: 5000,
            }))
            .await;
        match response {
            RpcResponse::Search(r) => {
                assert!(r.success, "{}", r.error);
                assert_eq!(r.results.len(), 2);
                assert_eq!(r.results[0].id, VectorId(1));
                assert_eq!(r.results[1].distance, 25.0);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_over_budget_is_not_success() {
        // A zero budget fails every load at the first batch boundary with
        // failed == 0; the response must still not claim success.
        let server = test_server_with_loader(LoaderConfig {
            load_timeout: std::time::Duration::ZERO,
            ..LoaderConfig::default()
        });

        let response = server
            .handle(RpcRequest::AddVectors(AddVectorsRequest {
                vectors: entries(&[(1, [0.0, 0.0]), (2, [3.0, 4.0])]),
                batch_size: 1,
                overwrite_existing: false,
            }))
            .await;
        match response {
            RpcResponse::AddVectors(r) => {
                assert!(!r.success);
                assert_eq!(r.added_count, 0);
                assert!(!r.error.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_and_update() {
        let server = test_server();
        server
            .handle(RpcRequest::AddVectors(AddVectorsRequest {
                vectors: entries(&[(1, [1.0, 1.0])]),
                batch_size: 10,
                overwrite_existing: false,
            }))
            .await;

        match server
            .handle(RpcRequest::UpdateVector { id: VectorId(1), vector: vec![2.0, 2.0] })
            .await
        {
            RpcResponse::Ack { success, .. } => assert!(success),
            other => panic!("unexpected response: {other:?}"),
        }

        match server.handle(RpcRequest::RemoveVector { id: VectorId(1) }).await {
            RpcResponse::Ack { success, .. } => assert!(success),
            other => panic!("unexpected response: {other:?}"),
        }

        // A second remove is NotFound.
        match server.handle(RpcRequest::RemoveVector { id: VectorId(1) }).await {
            RpcResponse::Ack { success, error } => {
                assert!(!success);
                assert!(error.contains("not found"), "{error}");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let server = test_server();
        match server.handle(RpcRequest::GetStats).await {
            RpcResponse::Stats(stats) => {
                assert_eq!(stats.total_vectors, 0);
                assert_eq!(stats.dimension, 2);
                assert_eq!(stats.index_type, "Flat");
            }
            other => panic!("unexpected response: {other:?}"),
        }
        match server.handle(RpcRequest::HealthCheck).await {
            RpcResponse::Health(health) => {
                assert!(health.healthy);
                assert_eq!(health.status, "ready");
                assert_eq!(health.details.get("node_id"), Some(&"n1".to_string()));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_apply_operation_and_sync() {
        let server = test_server();

        let op = dann_core::IndexOperation::new(OperationKind::Add, VectorId(5), 100, 3)
            .with_vector(vec![1.0, 2.0])
            .with_origin("n2");
        match server.handle(RpcRequest::ApplyOperation(op)).await {
            RpcResponse::Ack { success, .. } => assert!(success),
            other => panic!("unexpected response: {other:?}"),
        }

        // A peer with no versions receives the diff back.
        match server
            .handle(RpcRequest::SyncVersions { versions: Default::default() })
            .await
        {
            RpcResponse::Operations(ops) => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].id, VectorId(5));
                assert_eq!(ops[0].version, 3);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // A peer already at version 3 gets nothing.
        let versions = [(5i64, 3u64)].into_iter().collect();
        match server.handle(RpcRequest::SyncVersions { versions }).await {
            RpcResponse::Operations(ops) => assert!(ops.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_registers_node() {
        let server = test_server();
        server
            .handle(RpcRequest::Heartbeat {
                node_id: "n9".into(),
                address: "10.0.0.9".into(),
                port: 7009,
            })
            .await;
        assert!(server.membership.node("n9").is_some());
    }

    #[tokio::test]
    async fn test_shard_search_scoped_to_local_index() {
        let server = test_server();
        server
            .handle(RpcRequest::AddVectors(AddVectorsRequest {
                vectors: entries(&[(1, [0.0, 0.0])]),
                batch_size: 10,
                overwrite_existing: false,
            }))
            .await;

        match server
            .handle(RpcRequest::ShardSearch { query: vec![0.0, 0.0], k: 5 })
            .await
        {
            RpcResponse::ShardSearch { success, results, .. } => {
                assert!(success);
                assert_eq!(results.len(), 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Dimension mismatch surfaces as a failed shard search.
        match server
            .handle(RpcRequest::ShardSearch { query: vec![0.0], k: 5 })
            .await
        {
            RpcResponse::ShardSearch { success, error, .. } => {
                assert!(!success);
                assert!(error.contains("dimension"), "{error}");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
