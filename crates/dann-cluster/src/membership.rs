//! Cluster membership: node table, heartbeats, failure detection and the
//! shard-to-node map.
//!
//! The query router and consistency layer consume the read-only
//! [`ClusterView`] snapshot interface; the membership tracker knows nothing
//! about its consumers. Join/leave interest is registered as callbacks.

use dann_core::{now_ms, NodeInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Heartbeat silence after which a node is considered failed.
pub const DEFAULT_FAILURE_THRESHOLD: Duration = Duration::from_secs(30);

/// Read-only view of the cluster consumed by the router and the
/// consistency layer.
pub trait ClusterView: Send + Sync {
    /// All nodes currently considered alive.
    fn active_nodes(&self) -> Vec<NodeInfo>;

    /// Descriptor for one node, active or not.
    fn node(&self, node_id: &str) -> Option<NodeInfo>;

    /// Whether the node is registered and active.
    fn is_alive(&self, node_id: &str) -> bool;

    /// Owner of a shard, if assigned.
    fn node_for_shard(&self, shard_id: u32) -> Option<String>;
}

/// Observer invoked on membership changes.
pub type NodeEventCallback = Box<dyn Fn(&NodeInfo) + Send + Sync>;

/// Tracks cluster members and their health.
pub struct NodeManager {
    local: NodeInfo,
    nodes: RwLock<HashMap<String, NodeInfo>>,
    shard_map: RwLock<HashMap<u32, String>>,
    join_callbacks: Mutex<Vec<NodeEventCallback>>,
    leave_callbacks: Mutex<Vec<NodeEventCallback>>,
    failure_threshold: Duration,
    running: AtomicBool,
}

impl NodeManager {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let mut local = NodeInfo::new(node_id, address, port);
        local.is_active = true;
        local.last_heartbeat_ms = now_ms();

        let mut nodes = HashMap::new();
        nodes.insert(local.node_id.clone(), local.clone());

        Self {
            local,
            nodes: RwLock::new(nodes),
            shard_map: RwLock::new(HashMap::new()),
            join_callbacks: Mutex::new(Vec::new()),
            leave_callbacks: Mutex::new(Vec::new()),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            running: AtomicBool::new(true),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: Duration) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    pub fn local_node_id(&self) -> &str {
        &self.local.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Registers (or refreshes) a node and fires join callbacks for new
    /// arrivals.
    pub fn register_node(&self, mut node: NodeInfo) {
        node.is_active = true;
        node.last_heartbeat_ms = now_ms();

        let is_new = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let is_new = !nodes.contains_key(&node.node_id);
            nodes.insert(node.node_id.clone(), node.clone());
            is_new
        };

        if is_new {
            info!(node_id = %node.node_id, endpoint = %node.endpoint(), "node joined");
            self.fire(&self.join_callbacks, &node);
        }
    }

    /// Removes a node and fires leave callbacks.
    pub fn unregister_node(&self, node_id: &str) {
        let removed = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            nodes.remove(node_id)
        };
        if let Some(node) = removed {
            info!(node_id = %node_id, "node left");
            self.fire(&self.leave_callbacks, &node);
        }
    }

    /// Refreshes a node's heartbeat, reactivating it if it was marked
    /// failed.
    pub fn update_heartbeat(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.get_mut(node_id) {
            node.last_heartbeat_ms = now_ms();
            if !node.is_active {
                debug!(node_id = %node_id, "node recovered");
                node.is_active = true;
            }
        }
    }

    pub fn get_cluster_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<NodeInfo> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// Nodes whose heartbeat has gone silent past the threshold.
    pub fn get_failed_nodes(&self) -> Vec<NodeInfo> {
        let now = now_ms();
        let threshold = self.failure_threshold.as_millis() as u64;
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .values()
            .filter(|n| !n.is_active || now.saturating_sub(n.last_heartbeat_ms) > threshold)
            .cloned()
            .collect()
    }

    /// Assigns shards to a node, updating both the node record and the
    /// shard map.
    pub fn assign_shards(&self, node_id: &str, shard_ids: Vec<u32>) {
        {
            let mut map = self.shard_map.write().unwrap_or_else(|e| e.into_inner());
            for &shard in &shard_ids {
                map.insert(shard, node_id.to_string());
            }
        }
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.get_mut(node_id) {
            node.shard_ids = shard_ids;
        }
    }

    pub fn assigned_shards(&self, node_id: &str) -> Vec<u32> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .get(node_id)
            .map(|n| n.shard_ids.clone())
            .unwrap_or_default()
    }

    /// One health scan: deactivates nodes whose heartbeat is stale and
    /// fires leave callbacks for them. The local node never expires.
    pub fn check_node_health(&self) {
        let now = now_ms();
        let threshold = self.failure_threshold.as_millis() as u64;

        let newly_failed: Vec<NodeInfo> = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let mut failed = Vec::new();
            for node in nodes.values_mut() {
                if node.node_id == self.local.node_id {
                    continue;
                }
                if node.is_active && now.saturating_sub(node.last_heartbeat_ms) > threshold {
                    warn!(
                        node_id = %node.node_id,
                        silent_ms = now.saturating_sub(node.last_heartbeat_ms),
                        "node failed heartbeat check"
                    );
                    node.is_active = false;
                    failed.push(node.clone());
                }
            }
            failed
        };

        for node in &newly_failed {
            self.fire(&self.leave_callbacks, node);
        }
    }

    /// Spawns the background health monitor, scanning on `interval`.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while manager.is_running() {
                ticker.tick().await;
                manager.check_node_health();
            }
        })
    }

    /// Registers a join observer.
    pub fn on_node_join(&self, callback: NodeEventCallback) {
        self.join_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Registers a leave observer.
    pub fn on_node_leave(&self, callback: NodeEventCallback) {
        self.leave_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    fn fire(&self, callbacks: &Mutex<Vec<NodeEventCallback>>, node: &NodeInfo) {
        let callbacks = callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.iter() {
            callback(node);
        }
    }
}

impl ClusterView for NodeManager {
    fn active_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<NodeInfo> = nodes.values().filter(|n| n.is_active).cloned().collect();
        active.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        active
    }

    fn node(&self, node_id: &str) -> Option<NodeInfo> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(node_id).cloned()
    }

    fn is_alive(&self, node_id: &str) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(node_id).map(|n| n.is_active).unwrap_or(false)
    }

    fn node_for_shard(&self, shard_id: u32) -> Option<String> {
        let map = self.shard_map.read().unwrap_or_else(|e| e.into_inner());
        map.get(&shard_id).cloned()
    }
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("local", &self.local.node_id)
            .field("nodes", &self.get_cluster_nodes().len())
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_local_node_registered() {
        let manager = NodeManager::new("n1", "127.0.0.1", 7001);
        assert_eq!(manager.get_cluster_nodes().len(), 1);
        assert!(manager.is_alive("n1"));
    }

    #[test]
    fn test_register_and_unregister() {
        let manager = NodeManager::new("n1", "127.0.0.1", 7001);
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));
        assert_eq!(manager.get_cluster_nodes().len(), 2);
        assert!(manager.is_alive("n2"));

        manager.unregister_node("n2");
        assert_eq!(manager.get_cluster_nodes().len(), 1);
        assert!(!manager.is_alive("n2"));
    }

    #[test]
    fn test_join_leave_callbacks() {
        let manager = NodeManager::new("n1", "127.0.0.1", 7001);
        let joins = Arc::new(AtomicUsize::new(0));
        let leaves = Arc::new(AtomicUsize::new(0));

        let j = Arc::clone(&joins);
        manager.on_node_join(Box::new(move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        }));
        let l = Arc::clone(&leaves);
        manager.on_node_leave(Box::new(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        }));

        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));
        // Re-registering an existing node is a refresh, not a join.
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));
        manager.unregister_node("n2");

        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_health_check_marks_silent_nodes() {
        let manager =
            NodeManager::new("n1", "127.0.0.1", 7001).with_failure_threshold(Duration::ZERO);
        let mut stale = NodeInfo::new("n2", "127.0.0.1", 7002);
        stale.last_heartbeat_ms = 0;
        manager.register_node(stale);

        // register_node refreshed the heartbeat; backdate it again.
        {
            let mut nodes = manager.nodes.write().unwrap();
            nodes.get_mut("n2").unwrap().last_heartbeat_ms = 0;
        }

        manager.check_node_health();
        assert!(!manager.is_alive("n2"));
        assert!(manager.is_alive("n1"));
        assert_eq!(manager.active_nodes().len(), 1);

        // A heartbeat revives the node.
        manager.update_heartbeat("n2");
        assert!(manager.is_alive("n2"));
    }

    #[test]
    fn test_failed_nodes_listing() {
        let manager =
            NodeManager::new("n1", "127.0.0.1", 7001).with_failure_threshold(Duration::ZERO);
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));
        {
            let mut nodes = manager.nodes.write().unwrap();
            nodes.get_mut("n2").unwrap().last_heartbeat_ms = 0;
        }
        let failed = manager.get_failed_nodes();
        assert!(failed.iter().any(|n| n.node_id == "n2"));
    }

    #[test]
    fn test_shard_assignment() {
        let manager = NodeManager::new("n1", "127.0.0.1", 7001);
        manager.register_node(NodeInfo::new("n2", "127.0.0.1", 7002));
        manager.assign_shards("n1", vec![0, 2]);
        manager.assign_shards("n2", vec![1, 3]);

        assert_eq!(manager.node_for_shard(0), Some("n1".to_string()));
        assert_eq!(manager.node_for_shard(3), Some("n2".to_string()));
        assert_eq!(manager.node_for_shard(9), None);
        assert_eq!(manager.assigned_shards("n1"), vec![0, 2]);
    }

    #[test]
    fn test_active_nodes_sorted() {
        let manager = NodeManager::new("b", "127.0.0.1", 1);
        manager.register_node(NodeInfo::new("c", "127.0.0.1", 2));
        manager.register_node(NodeInfo::new("a", "127.0.0.1", 3));
        let ids: Vec<String> = manager.active_nodes().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
