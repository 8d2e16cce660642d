//! Eventual consistency over replicated mutations: per-vector versions and
//! clocks, the pending-replication queue, conflict resolution, and the
//! anti-entropy reconciliation round.

use crate::membership::ClusterView;
use dann_core::{
    DannError, IndexOperation, NodeInfo, Result, VectorClock, VectorId,
};
use dann_index::LocalVectorIndex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How replicated state is carried to peers. Implemented by the RPC client
/// pool; tests substitute in-process transports.
pub trait ReplicationTransport: Send + Sync {
    /// Pushes one operation to a peer.
    fn send_operation<'a>(
        &'a self,
        node: &'a NodeInfo,
        op: &'a IndexOperation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Sends our per-vector versions to a peer; the peer answers with the
    /// operations for every vector where it is strictly ahead.
    fn sync_versions<'a>(
        &'a self,
        node: &'a NodeInfo,
        versions: &'a HashMap<i64, u64>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<IndexOperation>>> + Send + 'a>>;
}

/// Conflict resolution strategy. Last-writer-wins is the default; the
/// element-wise vector merge is opt-in and produces the same result on all
/// replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    #[default]
    LastWriterWins,
    MergeVectors,
}

/// Tuning for the consistency manager.
#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    pub node_id: String,
    /// Outbound queue bound; a full queue blocks the writer rather than
    /// dropping operations.
    pub queue_capacity: usize,
    pub anti_entropy_interval: Duration,
    pub strategy: ConflictStrategy,
    /// Copies of each vector across the cluster; direct pushes go to
    /// `replication_factor - 1` peers and anti-entropy spreads the rest.
    pub replication_factor: usize,
}

impl ConsistencyConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            queue_capacity: 1024,
            anti_entropy_interval: Duration::from_secs(10),
            strategy: ConflictStrategy::default(),
            replication_factor: 3,
        }
    }

    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor.max(1);
        self
    }
}

/// Per-vector version and clock store plus the replication pipeline.
pub struct ConsistencyManager {
    config: ConsistencyConfig,
    versions: Mutex<HashMap<i64, u64>>,
    clocks: Mutex<HashMap<i64, VectorClock>>,
    /// Operations enqueued but not yet acknowledged by every peer, keyed by
    /// operation id.
    pending: Mutex<HashMap<String, IndexOperation>>,
    queue_tx: mpsc::Sender<IndexOperation>,
    queue_rx: Mutex<Option<mpsc::Receiver<IndexOperation>>>,
    /// Round-robin cursor for anti-entropy peer selection.
    peer_cursor: AtomicUsize,
    running: AtomicBool,
}

impl ConsistencyManager {
    pub fn new(config: ConsistencyConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            versions: Mutex::new(HashMap::new()),
            clocks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            queue_tx: tx,
            queue_rx: Mutex::new(Some(rx)),
            peer_cursor: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Version and clock state
    // =========================================================================

    pub fn get_vector_version(&self, id: VectorId) -> u64 {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id.as_i64())
            .copied()
            .unwrap_or(0)
    }

    /// Raises the stored version for `id`; never lowers it.
    pub fn update_vector_version(&self, id: VectorId, version: u64) {
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = versions.entry(id.as_i64()).or_insert(0);
        if version > *entry {
            *entry = version;
        }
    }

    pub fn get_vector_clock(&self, id: VectorId) -> VectorClock {
        self.clocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id.as_i64())
            .cloned()
            .unwrap_or_default()
    }

    /// Max-merges `clock` into the stored clock for `id`.
    pub fn update_vector_clock(&self, id: VectorId, clock: &VectorClock) {
        let mut clocks = self.clocks.lock().unwrap_or_else(|e| e.into_inner());
        clocks
            .entry(id.as_i64())
            .or_default()
            .update(clock);
    }

    /// Snapshot of every tracked version, for anti-entropy exchange.
    pub fn version_snapshot(&self) -> HashMap<i64, u64> {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // =========================================================================
    // Accept / apply
    // =========================================================================

    /// A mutation is accepted iff its version strictly exceeds the stored
    /// version, or its clock is not ordered before the stored clock.
    pub fn accepts(&self, op: &IndexOperation) -> bool {
        let stored = self.get_vector_version(op.id);
        if op.version > stored {
            return true;
        }
        match &op.clock {
            Some(clock) => !clock.happens_before(&self.get_vector_clock(op.id)),
            None => false,
        }
    }

    /// Installs `op`'s version (never lowering the stored one) and merges
    /// its clock. Returns whether the operation advanced the stored state.
    pub fn apply(&self, op: &IndexOperation) -> bool {
        let advanced = {
            let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
            let entry = versions.entry(op.id.as_i64()).or_insert(0);
            let advanced = op.version > *entry;
            if advanced {
                *entry = op.version;
            }
            advanced
        };
        if let Some(clock) = &op.clock {
            self.update_vector_clock(op.id, clock);
        }
        advanced
    }

    // =========================================================================
    // Conflict detection and resolution
    // =========================================================================

    /// Two operations conflict iff they target the same vector and their
    /// versions differ (equivalently: their clocks are concurrent).
    pub fn has_conflict(&self, a: &IndexOperation, b: &IndexOperation) -> bool {
        if a.id != b.id {
            return false;
        }
        if let (Some(ca), Some(cb)) = (&a.clock, &b.clock) {
            return ca.is_concurrent(cb);
        }
        a.version != b.version
    }

    /// Deterministic resolution over a non-empty conflict set.
    ///
    /// Last-writer-wins selects the operation with the maximum version,
    /// breaking version ties by the larger lexicographic origin node id, so
    /// the fold is commutative and associative. The merge strategy averages
    /// the conflicting payloads element-wise onto the winner.
    pub fn resolve_conflict(&self, ops: &[IndexOperation]) -> Result<IndexOperation> {
        let winner = ops
            .iter()
            .max_by(|a, b| {
                a.version
                    .cmp(&b.version)
                    .then_with(|| a.origin.cmp(&b.origin))
            })
            .cloned()
            .ok_or_else(|| DannError::BadRequest("empty conflict set".into()))?;

        match self.config.strategy {
            ConflictStrategy::LastWriterWins => Ok(winner),
            ConflictStrategy::MergeVectors => Ok(merge_vectors(ops, winner)),
        }
    }

    // =========================================================================
    // Propagation
    // =========================================================================

    /// Enqueues an operation for replication, recording it pending under
    /// its operation id. Blocks when the queue is full; operations are
    /// never dropped.
    pub async fn propagate(&self, mut op: IndexOperation) -> Result<()> {
        if op.origin.is_empty() {
            op.origin = self.config.node_id.clone();
        }
        if op.clock.is_none() {
            let mut clock = self.get_vector_clock(op.id);
            clock.increment(&self.config.node_id);
            self.update_vector_clock(op.id, &clock);
            op.clock = Some(clock);
        }
        self.apply(&op);

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.operation_id(), op.clone());

        self.queue_tx
            .send(op)
            .await
            .map_err(|_| DannError::Internal("propagation queue closed".into()))
    }

    /// Operations still awaiting acknowledgement.
    pub fn get_pending_replications(&self) -> Vec<IndexOperation> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut ops: Vec<IndexOperation> = pending.values().cloned().collect();
        ops.sort_by_key(|op| (op.version, op.id));
        ops
    }

    pub fn mark_replication_complete(&self, operation_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawns the propagation worker: drains the queue and pushes each
    /// operation to every active peer. A failed push leaves the operation
    /// pending; anti-entropy reconciles it later.
    pub fn spawn_propagation(
        self: &Arc<Self>,
        view: Arc<dyn ClusterView>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("propagation worker already running");

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                if !manager.is_running() {
                    break;
                }
                let mut peers: Vec<NodeInfo> = view
                    .active_nodes()
                    .into_iter()
                    .filter(|n| n.node_id != manager.config.node_id)
                    .collect();
                peers.truncate(manager.config.replication_factor.saturating_sub(1));

                let mut all_ok = true;
                for peer in &peers {
                    if let Err(e) = transport.send_operation(peer, &op).await {
                        warn!(
                            peer = %peer.node_id,
                            op = %op.operation_id(),
                            error = %e,
                            "replication push failed, leaving operation pending"
                        );
                        all_ok = false;
                    }
                }

                if all_ok {
                    manager.mark_replication_complete(&op.operation_id());
                    debug!(op = %op.operation_id(), peers = peers.len(), "operation replicated");
                }
            }
        })
    }

    // =========================================================================
    // Anti-entropy
    // =========================================================================

    /// One reconciliation exchange with `peer`: ship our version map, apply
    /// every operation the peer is strictly ahead on.
    pub async fn sync_with_node(
        &self,
        peer: &NodeInfo,
        index: &LocalVectorIndex,
        transport: &dyn ReplicationTransport,
    ) -> Result<usize> {
        let versions = self.version_snapshot();
        let ops = transport.sync_versions(peer, &versions).await?;
        let mut applied = 0;
        for op in &ops {
            if self.accepts(op) {
                index.apply_remote(op)?;
                self.apply(op);
                applied += 1;
            }
        }
        if applied > 0 {
            info!(peer = %peer.node_id, applied = applied, "anti-entropy applied diffs");
        }
        Ok(applied)
    }

    /// Spawns the anti-entropy worker: every interval, reconcile with the
    /// next active peer in round-robin order.
    pub fn spawn_anti_entropy(
        self: &Arc<Self>,
        view: Arc<dyn ClusterView>,
        transport: Arc<dyn ReplicationTransport>,
        index: Arc<LocalVectorIndex>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.anti_entropy_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !manager.is_running() {
                    break;
                }
                let peers: Vec<NodeInfo> = view
                    .active_nodes()
                    .into_iter()
                    .filter(|n| n.node_id != manager.config.node_id)
                    .collect();
                if peers.is_empty() {
                    continue;
                }
                let cursor = manager.peer_cursor.fetch_add(1, Ordering::Relaxed);
                let peer = &peers[cursor % peers.len()];
                if let Err(e) = manager.sync_with_node(peer, &index, transport.as_ref()).await {
                    warn!(peer = %peer.node_id, error = %e, "anti-entropy round failed");
                }
            }
        })
    }

    /// Answers a peer's version exchange: for every vector where we are
    /// strictly ahead of `remote_versions`, build an operation carrying our
    /// current state.
    pub fn diff_operations(
        &self,
        remote_versions: &HashMap<i64, u64>,
        index: &LocalVectorIndex,
    ) -> Vec<IndexOperation> {
        use dann_core::{now_ms, OperationKind};

        let local = self.version_snapshot();
        let mut ops = Vec::new();
        for (&raw_id, &local_version) in &local {
            let remote = remote_versions.get(&raw_id).copied().unwrap_or(0);
            if local_version <= remote {
                continue;
            }
            let id = VectorId(raw_id);
            let op = match index.get_vector(id) {
                Some(vector) => {
                    IndexOperation::new(OperationKind::Update, id, now_ms(), local_version)
                        .with_vector(vector)
                }
                None => IndexOperation::new(OperationKind::Delete, id, now_ms(), local_version),
            };
            let mut op = op.with_origin(self.config.node_id.clone());
            op.clock = Some(self.get_vector_clock(id));
            ops.push(op);
        }
        ops.sort_by_key(|op| op.id);
        ops
    }
}

/// Element-wise mean of the conflicting payloads, attached to the winning
/// operation. Deterministic for a given conflict set regardless of order.
fn merge_vectors(ops: &[IndexOperation], mut winner: IndexOperation) -> IndexOperation {
    let payloads: Vec<&Vec<f32>> = ops.iter().filter_map(|op| op.vector.as_ref()).collect();
    if payloads.is_empty() {
        return winner;
    }
    let dim = payloads[0].len();
    if payloads.iter().any(|p| p.len() != dim) {
        return winner;
    }
    let mut merged = vec![0.0f32; dim];
    for payload in &payloads {
        for (m, &v) in merged.iter_mut().zip(payload.iter()) {
            *m += v;
        }
    }
    let inv = 1.0 / payloads.len() as f32;
    for m in &mut merged {
        *m *= inv;
    }
    winner.vector = Some(merged);
    winner
}

impl std::fmt::Debug for ConsistencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyManager")
            .field("node_id", &self.config.node_id)
            .field("pending", &self.pending_count())
            .field("strategy", &self.config.strategy)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
