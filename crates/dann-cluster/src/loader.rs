//! Bulk-loading pipeline: validation, a bounded worker pool over a FIFO
//! queue, per-load progress with linear ETA, retry with exponential
//! backoff, cancellation, and load metrics.

use crate::consistency::ConsistencyManager;
use dann_core::{now_ms, BulkLoadRequest, DannError, NodeInfo, Result, VectorId};
use dann_index::LocalVectorIndex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Lifecycle of one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl LoadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LoadStatus::Pending | LoadStatus::Running)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadStatus::Pending => "pending",
            LoadStatus::Running => "running",
            LoadStatus::Completed => "completed",
            LoadStatus::CompletedWithErrors => "completed_with_errors",
            LoadStatus::Failed => "failed",
            LoadStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of one load.
#[derive(Debug, Clone, Default)]
pub struct LoadProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub status: LoadStatus,
    pub start_ms: u64,
    /// Estimated completion timestamp, linear in the processed fraction.
    pub eta_ms: u64,
}

impl LoadProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed + self.failed) as f64 * 100.0 / self.total as f64
        }
    }
}

/// How a batch that keeps failing is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStrategy {
    /// Abort the task on the first failing batch.
    #[default]
    FailFast,
    /// Tally the batch as failed and move on.
    SkipFailed,
    /// Retry with backoff, then tally and move on.
    RetryAll,
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fail_fast" => Ok(ErrorStrategy::FailFast),
            "skip_failed" => Ok(ErrorStrategy::SkipFailed),
            "retry_all" => Ok(ErrorStrategy::RetryAll),
            other => Err(format!("unknown error handling strategy: {other}")),
        }
    }
}

/// Loader tuning.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub max_concurrent_loads: usize,
    pub retry_attempts: usize,
    pub retry_backoff: Duration,
    pub error_strategy: ErrorStrategy,
    /// FIFO queue bound; a full queue blocks submitters.
    pub queue_capacity: usize,
    /// Budget for one load; checked at batch boundaries.
    pub load_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent_loads: 4,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            error_strategy: ErrorStrategy::default(),
            queue_capacity: 64,
            load_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Cumulative loader metrics.
#[derive(Debug, Clone, Default)]
pub struct LoadMetrics {
    pub total_loads: u64,
    pub successful_loads: u64,
    pub failed_loads: u64,
    pub total_vectors_loaded: u64,
    pub avg_load_time_ms: f64,
    pub avg_vectors_per_second: f64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_loads: u64,
    successful_loads: u64,
    failed_loads: u64,
    total_vectors_loaded: u64,
    total_load_time_ms: u64,
}

struct LoadTask {
    request: BulkLoadRequest,
    progress: LoadProgress,
    cancelled: Arc<AtomicBool>,
    done_tx: Option<oneshot::Sender<bool>>,
}

/// Completion handle for a submitted load.
#[derive(Debug)]
pub struct LoadHandle {
    pub load_id: String,
    rx: oneshot::Receiver<bool>,
}

impl LoadHandle {
    /// Resolves once the load reaches a terminal status; `true` means the
    /// load completed (possibly with skipped batches).
    pub async fn await_completion(self) -> Result<bool> {
        self.rx
            .await
            .map_err(|_| DannError::Internal("load task dropped its completion handle".into()))
    }
}

/// Dispatch of a partitioned sub-request to a peer, implemented by the RPC
/// client pool.
pub trait LoadTransport: Send + Sync {
    fn add_vectors<'a>(
        &'a self,
        node: &'a NodeInfo,
        vectors: &'a [f32],
        ids: &'a [VectorId],
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>>;
}

/// Schedules bulk loads into the local index.
pub struct BulkLoader {
    index: Arc<LocalVectorIndex>,
    consistency: Option<Arc<ConsistencyManager>>,
    config: LoaderConfig,
    tasks: Mutex<HashMap<String, LoadTask>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    metrics: Mutex<MetricsInner>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl BulkLoader {
    pub fn new(
        index: Arc<LocalVectorIndex>,
        consistency: Option<Arc<ConsistencyManager>>,
        config: LoaderConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            index,
            consistency,
            config,
            tasks: Mutex::new(HashMap::new()),
            queue_tx: tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(rx)),
            metrics: Mutex::new(MetricsInner::default()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        })
    }

    /// Spawns the worker pool; idempotent.
    pub fn start_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        (0..self.config.max_concurrent_loads.max(1))
            .map(|worker| {
                let loader = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(worker = worker, "bulk-load worker started");
                    loop {
                        let load_id = {
                            let mut rx = loader.queue_rx.lock().await;
                            rx.recv().await
                        };
                        match load_id {
                            Some(load_id) => loader.process(&load_id).await,
                            None => break,
                        }
                    }
                })
            })
            .collect()
    }

    /// Validates and enqueues a load. Blocks when the queue is at capacity.
    pub async fn submit(&self, request: BulkLoadRequest) -> Result<LoadHandle> {
        self.validate(&request)?;

        let load_id = format!(
            "load-{}-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst),
            now_ms()
        );
        let (done_tx, rx) = oneshot::channel();
        let total = request.ids.len() as u64;

        let task = LoadTask {
            request,
            progress: LoadProgress {
                total,
                status: LoadStatus::Pending,
                start_ms: now_ms(),
                ..LoadProgress::default()
            },
            cancelled: Arc::new(AtomicBool::new(false)),
            done_tx: Some(done_tx),
        };
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(load_id.clone(), task);

        self.queue_tx
            .send(load_id.clone())
            .await
            .map_err(|_| DannError::Internal("load queue closed".into()))?;

        info!(load_id = %load_id, total = total, "load enqueued");
        Ok(LoadHandle { load_id, rx })
    }

    /// Submits a load and waits for it to finish.
    pub async fn load_sync(&self, request: BulkLoadRequest) -> Result<LoadProgress> {
        let handle = self.submit(request).await?;
        let load_id = handle.load_id.clone();
        handle.await_completion().await?;
        self.get_progress(&load_id)
    }

    fn validate(&self, request: &BulkLoadRequest) -> Result<()> {
        if request.ids.is_empty() {
            return Err(DannError::BadRequest("empty id list".into()));
        }
        if request.vectors.is_empty() {
            return Err(DannError::BadRequest("empty vector buffer".into()));
        }
        let dim = self.index.dimension();
        if request.vectors.len() % dim != 0 {
            return Err(DannError::BadRequest(format!(
                "vector buffer length {} is not a multiple of dim {}",
                request.vectors.len(),
                dim
            )));
        }
        if request.vectors.len() / dim != request.ids.len() {
            return Err(DannError::BadRequest(format!(
                "{} vectors for {} ids",
                request.vectors.len() / dim,
                request.ids.len()
            )));
        }
        Ok(())
    }

    async fn process(&self, load_id: &str) {
        let (request, cancelled) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let Some(task) = tasks.get_mut(load_id) else {
                warn!(load_id = %load_id, "dequeued unknown load");
                return;
            };
            task.progress.status = LoadStatus::Running;
            task.progress.start_ms = now_ms();
            (task.request.clone(), Arc::clone(&task.cancelled))
        };

        let dim = self.index.dimension();
        let batch_size = request.batch_size.max(1).min(self.config.batch_size.max(1));
        let total = request.ids.len() as u64;
        let start_ms = now_ms();

        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut hard_failure = false;

        let chunks = request
            .ids
            .chunks(batch_size)
            .zip(request.vectors.chunks(batch_size * dim));

        for (chunk_ids, chunk_vectors) in chunks {
            if cancelled.load(Ordering::SeqCst) {
                info!(load_id = %load_id, processed = processed, "load cancelled");
                self.finish(load_id, LoadStatus::Cancelled, processed, failed, start_ms);
                return;
            }
            if now_ms().saturating_sub(start_ms) >= self.config.load_timeout.as_millis() as u64 {
                warn!(
                    load_id = %load_id,
                    budget_ms = self.config.load_timeout.as_millis() as u64,
                    "load exceeded its budget"
                );
                self.finish(load_id, LoadStatus::Failed, processed, failed, start_ms);
                return;
            }

            if request.overwrite_existing {
                for &id in chunk_ids {
                    if self.index.contains(id) {
                        let _ = self.index.remove_vector(id);
                    }
                }
            }

            match self.load_batch(chunk_vectors, chunk_ids).await {
                Ok(()) => {
                    processed += chunk_ids.len() as u64;
                    self.forward_operations().await;
                }
                Err(e) => match self.config.error_strategy {
                    ErrorStrategy::FailFast => {
                        warn!(load_id = %load_id, error = %e, "batch failed, aborting load");
                        hard_failure = true;
                        break;
                    }
                    ErrorStrategy::SkipFailed | ErrorStrategy::RetryAll => {
                        warn!(load_id = %load_id, error = %e, "batch failed, skipping");
                        failed += chunk_ids.len() as u64;
                    }
                },
            }

            self.update_progress(load_id, processed, failed, start_ms, total);
        }

        let status = if hard_failure {
            LoadStatus::Failed
        } else if failed == 0 {
            LoadStatus::Completed
        } else {
            LoadStatus::CompletedWithErrors
        };
        self.finish(load_id, status, processed, failed, start_ms);
    }

    /// One batch insert; `retry_all` retries with exponential backoff
    /// before giving up on the batch.
    async fn load_batch(&self, vectors: &[f32], ids: &[VectorId]) -> Result<()> {
        let attempts = match self.config.error_strategy {
            ErrorStrategy::RetryAll => self.config.retry_attempts.max(1),
            _ => 1,
        };
        let mut backoff = self.config.retry_backoff;
        let mut last = None;
        for attempt in 0..attempts {
            match self.index.add_vectors(vectors, ids) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = Some(e);
                    if attempt + 1 < attempts {
                        debug!(attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, "retrying batch");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| DannError::Internal("batch failed with no error".into())))
    }

    /// Hands recorded mutations to the consistency layer for replication.
    async fn forward_operations(&self) {
        let Some(consistency) = &self.consistency else {
            self.index.clear_pending_operations();
            return;
        };
        for op in self.index.take_pending_operations() {
            if let Err(e) = consistency.propagate(op).await {
                warn!(error = %e, "failed to enqueue operation for replication");
            }
        }
    }

    fn update_progress(
        &self,
        load_id: &str,
        processed: u64,
        failed: u64,
        start_ms: u64,
        total: u64,
    ) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = tasks.get_mut(load_id) {
            task.progress.processed = processed;
            task.progress.failed = failed;
            let done = processed + failed;
            if done > 0 && done < total {
                let elapsed = now_ms().saturating_sub(start_ms);
                task.progress.eta_ms = start_ms + elapsed * total / done;
            }
        }
    }

    fn finish(&self, load_id: &str, status: LoadStatus, processed: u64, failed: u64, start_ms: u64) {
        let elapsed_ms = now_ms().saturating_sub(start_ms);

        // The completion handle is resolved outside the task lock.
        let done_tx = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            match tasks.get_mut(load_id) {
                Some(task) => {
                    task.progress.status = status;
                    task.progress.processed = processed;
                    task.progress.failed = failed;
                    task.progress.eta_ms = now_ms();
                    task.done_tx.take()
                }
                None => None,
            }
        };

        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.total_loads += 1;
            metrics.total_load_time_ms += elapsed_ms;
            metrics.total_vectors_loaded += processed;
            match status {
                LoadStatus::Completed | LoadStatus::CompletedWithErrors => {
                    metrics.successful_loads += 1
                }
                _ => metrics.failed_loads += 1,
            }
        }

        info!(
            load_id = %load_id,
            status = %status,
            processed = processed,
            failed = failed,
            elapsed_ms = elapsed_ms,
            "load finished"
        );

        if let Some(tx) = done_tx {
            let _ = tx.send(!matches!(status, LoadStatus::Failed | LoadStatus::Cancelled));
        }
    }

    // =========================================================================
    // Introspection and control
    // =========================================================================

    pub fn get_progress(&self, load_id: &str) -> Result<LoadProgress> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(load_id)
            .map(|t| t.progress.clone())
            .ok_or_else(|| DannError::BadRequest(format!("unknown load id: {load_id}")))
    }

    /// Loads that have not reached a terminal status.
    pub fn get_active_loads(&self) -> Vec<String> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<String> = tasks
            .iter()
            .filter(|(_, t)| !t.progress.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        active
    }

    /// Flags a load for cancellation; the worker exits at the next batch
    /// boundary.
    pub fn cancel_load(&self, load_id: &str) -> Result<()> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get(load_id) {
            Some(task) => {
                task.cancelled.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(DannError::BadRequest(format!("unknown load id: {load_id}"))),
        }
    }

    pub fn get_metrics(&self) -> LoadMetrics {
        let inner = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let avg_load_time_ms = if inner.total_loads > 0 {
            inner.total_load_time_ms as f64 / inner.total_loads as f64
        } else {
            0.0
        };
        let avg_vectors_per_second = if inner.total_load_time_ms > 0 {
            inner.total_vectors_loaded as f64 * 1000.0 / inner.total_load_time_ms as f64
        } else {
            0.0
        };
        LoadMetrics {
            total_loads: inner.total_loads,
            successful_loads: inner.successful_loads,
            failed_loads: inner.failed_loads,
            total_vectors_loaded: inner.total_vectors_loaded,
            avg_load_time_ms,
            avg_vectors_per_second,
        }
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner()) = MetricsInner::default();
    }

    // =========================================================================
    // Distributed loading
    // =========================================================================

    /// Splits a request across `nodes` by `hash(id) mod node_count` and
    /// dispatches one sub-request per node (the local node's partition is
    /// loaded in-process). Succeeds iff every sub-request succeeds.
    pub async fn distributed_load(
        &self,
        request: &BulkLoadRequest,
        nodes: &[NodeInfo],
        local_node_id: &str,
        transport: &dyn LoadTransport,
    ) -> Result<u64> {
        self.validate(request)?;
        if nodes.is_empty() {
            return Err(DannError::BadRequest("no target nodes".into()));
        }

        let dim = self.index.dimension();
        let partitions = partition_request(request, dim, nodes.len());

        let mut loaded = 0u64;
        for (node, (ids, vectors)) in nodes.iter().zip(partitions) {
            if ids.is_empty() {
                continue;
            }
            if node.node_id == local_node_id {
                let sub = BulkLoadRequest::new(vectors, ids.clone())
                    .with_batch_size(request.batch_size);
                let progress = self.load_sync(sub).await?;
                if matches!(progress.status, LoadStatus::Failed | LoadStatus::Cancelled) {
                    return Err(DannError::Internal(format!(
                        "local partition finished {}",
                        progress.status
                    )));
                }
                loaded += progress.processed;
            } else {
                loaded += transport
                    .add_vectors(node, &vectors, &ids, request.batch_size)
                    .await?;
            }
        }
        Ok(loaded)
    }
}

/// Partitions `(ids, vectors)` into `node_count` buckets by id hash.
fn partition_request(
    request: &BulkLoadRequest,
    dim: usize,
    node_count: usize,
) -> Vec<(Vec<VectorId>, Vec<f32>)> {
    let mut buckets: Vec<(Vec<VectorId>, Vec<f32>)> = vec![Default::default(); node_count];
    for (i, &id) in request.ids.iter().enumerate() {
        let mut hasher = DefaultHasher::new();
        id.as_i64().hash(&mut hasher);
        let bucket = (hasher.finish() % node_count as u64) as usize;
        buckets[bucket].0.push(id);
        buckets[bucket]
            .1
            .extend_from_slice(&request.vectors[i * dim..(i + 1) * dim]);
    }
    buckets
}

impl std::fmt::Debug for BulkLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkLoader")
            .field("active_loads", &self.get_active_loads().len())
            .field("batch_size", &self.config.batch_size)
            .field("max_concurrent_loads", &self.config.max_concurrent_loads)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dann_core::IndexType;
    use dann_index::IvfConfig;

    fn index(dim: usize) -> Arc<LocalVectorIndex> {
        Arc::new(LocalVectorIndex::new(IndexType::Flat, IvfConfig::new(dim)).unwrap())
    }

    fn loader(index: Arc<LocalVectorIndex>) -> Arc<BulkLoader> {
        let loader = BulkLoader::new(index, None, LoaderConfig::default());
        loader.start_workers();
        loader
    }

    fn request(n: usize, dim: usize, batch: usize) -> BulkLoadRequest {
        let vectors: Vec<f32> = (0..n * dim).map(|i| i as f32 * 0.01).collect();
        let ids: Vec<VectorId> = (0..n).map(|i| VectorId(i as i64)).collect();
        BulkLoadRequest::new(vectors, ids).with_batch_size(batch)
    }

    #[tokio::test]
    async fn test_load_thousand_vectors() {
        let idx = index(4);
        let loader = loader(Arc::clone(&idx));

        let progress = loader.load_sync(request(1000, 4, 100)).await.unwrap();
        assert_eq!(progress.status, LoadStatus::Completed);
        assert_eq!(progress.processed, 1000);
        assert_eq!(progress.failed, 0);
        assert_eq!(idx.size(), 1000);

        let metrics = loader.get_metrics();
        assert_eq!(metrics.total_loads, 1);
        assert_eq!(metrics.successful_loads, 1);
        assert_eq!(metrics.total_vectors_loaded, 1000);

        // A loaded vector is findable as its own nearest neighbor.
        let base = 200 * 4;
        let query: Vec<f32> = (0..4).map(|d| (base + d) as f32 * 0.01).collect();
        let results = idx.search(&query, 1).unwrap();
        assert_eq!(results[0].id, VectorId(200));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_enqueue() {
        let loader = loader(index(4));

        // Empty ids.
        let bad = BulkLoadRequest::new(vec![1.0; 4], vec![]);
        assert!(matches!(
            loader.submit(bad).await.unwrap_err(),
            DannError::BadRequest(_)
        ));

        // Ragged buffer.
        let bad = BulkLoadRequest::new(vec![1.0; 5], vec![VectorId(1)]);
        assert!(loader.submit(bad).await.is_err());

        // Count mismatch.
        let bad = BulkLoadRequest::new(vec![1.0; 4], vec![VectorId(1), VectorId(2)]);
        assert!(loader.submit(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_and_unknown_load() {
        let loader = loader(index(2));
        let progress = loader.load_sync(request(10, 2, 5)).await.unwrap();
        assert_eq!(progress.total, 10);
        assert!(progress.status.is_terminal());

        assert!(matches!(
            loader.get_progress("load-nope").unwrap_err(),
            DannError::BadRequest(_)
        ));
        assert!(loader.cancel_load("load-nope").is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_processing() {
        let idx = index(2);
        // No workers started: the task sits in the queue.
        let loader = BulkLoader::new(Arc::clone(&idx), None, LoaderConfig::default());
        let handle = loader.submit(request(100, 2, 10)).await.unwrap();
        loader.cancel_load(&handle.load_id).unwrap();

        loader.start_workers();
        assert!(!handle.await_completion().await.unwrap());

        let metrics = loader.get_metrics();
        assert_eq!(metrics.failed_loads, 1);
        assert_eq!(idx.size(), 0);
    }

    #[tokio::test]
    async fn test_zero_budget_load_fails() {
        let idx = index(2);
        let loader = BulkLoader::new(
            Arc::clone(&idx),
            None,
            LoaderConfig {
                load_timeout: Duration::ZERO,
                ..LoaderConfig::default()
            },
        );
        loader.start_workers();

        let progress = loader.load_sync(request(10, 2, 5)).await.unwrap();
        assert_eq!(progress.status, LoadStatus::Failed);
        assert_eq!(progress.processed, 0);
        assert_eq!(loader.get_metrics().failed_loads, 1);
    }

    #[tokio::test]
    async fn test_overwrite_existing() {
        let idx = index(2);
        idx.add_vectors(&[9.0, 9.0], &[VectorId(0)]).unwrap();
        let loader = loader(Arc::clone(&idx));

        let mut req = request(3, 2, 10);
        req.overwrite_existing = true;
        let progress = loader.load_sync(req).await.unwrap();
        assert_eq!(progress.status, LoadStatus::Completed);
        // Old payload for id 0 was replaced, not duplicated.
        assert_eq!(idx.size(), 3);
        assert_eq!(idx.get_vector(VectorId(0)), Some(vec![0.0, 0.01]));
    }

    #[tokio::test]
    async fn test_metrics_reset() {
        let loader = loader(index(2));
        loader.load_sync(request(4, 2, 2)).await.unwrap();
        assert_eq!(loader.get_metrics().total_loads, 1);
        loader.reset_metrics();
        assert_eq!(loader.get_metrics().total_loads, 0);
    }

    #[tokio::test]
    async fn test_concurrent_loads() {
        let idx = index(2);
        let loader = loader(Arc::clone(&idx));

        let mut handles = Vec::new();
        for batch in 0..4 {
            let vectors: Vec<f32> = (0..20).map(|i| (batch * 100 + i) as f32).collect();
            let ids: Vec<VectorId> = (0..10).map(|i| VectorId((batch * 10 + i) as i64)).collect();
            handles.push(
                loader
                    .submit(BulkLoadRequest::new(vectors, ids).with_batch_size(3))
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            assert!(handle.await_completion().await.unwrap());
        }
        assert_eq!(idx.size(), 40);
        assert_eq!(loader.get_metrics().total_loads, 4);
        assert!(loader.get_active_loads().is_empty());
    }

    #[test]
    fn test_partition_request_covers_all_ids() {
        let req = request(100, 2, 10);
        let partitions = partition_request(&req, 2, 3);
        let total: usize = partitions.iter().map(|(ids, _)| ids.len()).sum();
        assert_eq!(total, 100);
        for (ids, vectors) in &partitions {
            assert_eq!(vectors.len(), ids.len() * 2);
        }
        // Deterministic partitioning.
        let again = partition_request(&req, 2, 3);
        assert_eq!(partitions.len(), again.len());
        for (a, b) in partitions.iter().zip(again.iter()) {
            assert_eq!(a.0, b.0);
        }
    }

    #[tokio::test]
    async fn test_distributed_load_local_only() {
        let idx = index(2);
        let loader = loader(Arc::clone(&idx));

        struct NoRemote;
        impl LoadTransport for NoRemote {
            fn add_vectors<'a>(
                &'a self,
                _node: &'a NodeInfo,
                _vectors: &'a [f32],
                _ids: &'a [VectorId],
                _batch_size: usize,
            ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
                Box::pin(async { Err(DannError::Transient("no remote in this test".into())) })
            }
        }

        let nodes = vec![NodeInfo::new("n1", "127.0.0.1", 7001)];
        let loaded = loader
            .distributed_load(&request(50, 2, 10), &nodes, "n1", &NoRemote)
            .await
            .unwrap();
        assert_eq!(loaded, 50);
        assert_eq!(idx.size(), 50);
    }

    #[test]
    fn test_error_strategy_parse() {
        assert_eq!("fail_fast".parse::<ErrorStrategy>().unwrap(), ErrorStrategy::FailFast);
        assert_eq!("skip_failed".parse::<ErrorStrategy>().unwrap(), ErrorStrategy::SkipFailed);
        assert_eq!("retry_all".parse::<ErrorStrategy>().unwrap(), ErrorStrategy::RetryAll);
        assert!("explode".parse::<ErrorStrategy>().is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(LoadStatus::CompletedWithErrors.to_string(), "completed_with_errors");
        assert_eq!(LoadStatus::Pending.to_string(), "pending");
    }
}
