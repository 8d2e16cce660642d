//! RPC client and connection pool.
//!
//! The pool keeps one framed connection per endpoint, connects lazily, and
//! drops a connection on the first transport error so the next request
//! redials. It implements the transport seams consumed by the router, the
//! consistency manager, and the bulk loader.

use super::codec::{read_frame, write_frame};
use super::messages::*;
use crate::consistency::ReplicationTransport;
use crate::loader::LoadTransport;
use crate::router::QueryTransport;
use dann_core::{DannError, IndexOperation, NodeInfo, Result, SearchResult, VectorId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// One framed connection to a peer. Requests are serialized over the
/// connection by a mutex, matching the one-in-one-out framing.
pub struct RpcClient {
    addr: String,
    stream: tokio::sync::Mutex<TcpStream>,
}

impl RpcClient {
    /// Dials `addr` within `connect_timeout`.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DannError::Timeout(connect_timeout.as_millis() as u64))?
            .map_err(|e| DannError::Transient(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DannError::Transient(e.to_string()))?;
        debug!(addr = %addr, "connected");
        Ok(Self {
            addr: addr.to_string(),
            stream: tokio::sync::Mutex::new(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One request/response exchange bounded by `timeout`.
    pub async fn request(&self, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        let mut stream = self.stream.lock().await;
        tokio::time::timeout(timeout, async {
            write_frame(&mut *stream, request).await?;
            read_frame(&mut *stream).await
        })
        .await
        .map_err(|_| DannError::Timeout(timeout.as_millis() as u64))?
    }
}

/// Lazy connection pool keyed by endpoint.
pub struct RpcClientPool {
    clients: DashMap<String, Arc<RpcClient>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RpcClientPool {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            connect_timeout,
            request_timeout,
        })
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    /// Drops the pooled connection for an endpoint.
    pub fn disconnect(&self, endpoint: &str) {
        self.clients.remove(endpoint);
    }

    async fn client(&self, endpoint: &str) -> Result<Arc<RpcClient>> {
        if let Some(client) = self.clients.get(endpoint) {
            return Ok(Arc::clone(&client));
        }
        let client = Arc::new(RpcClient::connect(endpoint, self.connect_timeout).await?);
        self.clients.insert(endpoint.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Request with automatic connection cleanup on transport failure.
    pub async fn request(&self, endpoint: &str, request: &RpcRequest) -> Result<RpcResponse> {
        let client = self.client(endpoint).await?;
        match client.request(request, self.request_timeout).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.disconnect(endpoint);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    /// Cluster-wide search served by whichever node `endpoint` names.
    pub async fn search(
        &self,
        endpoint: &str,
        query: &[f32],
        k: usize,
        timeout_ms: u32,
    ) -> Result<SearchResponse> {
        let request = RpcRequest::Search(SearchRequest {
            query: query.to_vec(),
            k: k as i32,
            consistency_level: Default::default(),
            timeout_ms,
        });
        match self.request(endpoint, &request).await? {
            RpcResponse::Search(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    pub async fn health_check(&self, endpoint: &str) -> Result<HealthResponse> {
        match self.request(endpoint, &RpcRequest::HealthCheck).await? {
            RpcResponse::Health(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_stats(&self, endpoint: &str) -> Result<StatsResponse> {
        match self.request(endpoint, &RpcRequest::GetStats).await? {
            RpcResponse::Stats(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heartbeat(&self, endpoint: &str, local: &NodeInfo) -> Result<()> {
        let request = RpcRequest::Heartbeat {
            node_id: local.node_id.clone(),
            address: local.address.clone(),
            port: local.port,
        };
        match self.request(endpoint, &request).await? {
            RpcResponse::Ack { success: true, .. } => Ok(()),
            RpcResponse::Ack { error, .. } => Err(DannError::Transient(error)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: RpcResponse) -> DannError {
    DannError::Transient(format!("unexpected response variant: {response:?}"))
}

impl QueryTransport for RpcClientPool {
    fn shard_search<'a>(
        &'a self,
        node: &'a NodeInfo,
        query: &'a [f32],
        k: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SearchResult>>> + Send + 'a>> {
        Box::pin(async move {
            let request = RpcRequest::ShardSearch {
                query: query.to_vec(),
                k: k as u32,
            };
            match self.request(&node.endpoint(), &request).await? {
                RpcResponse::ShardSearch { success: true, results, .. } => Ok(results),
                RpcResponse::ShardSearch { error, .. } => Err(DannError::Transient(error)),
                other => Err(unexpected(other)),
            }
        })
    }
}

impl ReplicationTransport for RpcClientPool {
    fn send_operation<'a>(
        &'a self,
        node: &'a NodeInfo,
        op: &'a IndexOperation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let request = RpcRequest::ApplyOperation(op.clone());
            match self.request(&node.endpoint(), &request).await? {
                RpcResponse::Ack { success: true, .. } => Ok(()),
                RpcResponse::Ack { error, .. } => Err(DannError::Transient(error)),
                other => Err(unexpected(other)),
            }
        })
    }

    fn sync_versions<'a>(
        &'a self,
        node: &'a NodeInfo,
        versions: &'a HashMap<i64, u64>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<IndexOperation>>> + Send + 'a>> {
        Box::pin(async move {
            let request = RpcRequest::SyncVersions {
                versions: versions.clone(),
            };
            match self.request(&node.endpoint(), &request).await? {
                RpcResponse::Operations(ops) => Ok(ops),
                other => Err(unexpected(other)),
            }
        })
    }
}

impl LoadTransport for RpcClientPool {
    fn add_vectors<'a>(
        &'a self,
        node: &'a NodeInfo,
        vectors: &'a [f32],
        ids: &'a [VectorId],
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            let dim = if ids.is_empty() { 0 } else { vectors.len() / ids.len() };
            let entries: Vec<VectorEntry> = ids
                .iter()
                .enumerate()
                .map(|(i, &id)| VectorEntry {
                    id,
                    data: vectors[i * dim..(i + 1) * dim].to_vec(),
                })
                .collect();
            let request = RpcRequest::AddVectors(AddVectorsRequest {
                vectors: entries,
                batch_size: batch_size as i32,
                overwrite_existing: false,
            });
            match self.request(&node.endpoint(), &request).await? {
                RpcResponse::AddVectors(response) if response.success => Ok(response.added_count),
                RpcResponse::AddVectors(response) => Err(DannError::Transient(response.error)),
                other => Err(unexpected(other)),
            }
        })
    }
}

impl std::fmt::Debug for RpcClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientPool")
            .field("connected", &self.clients.len())
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
