//! Load balancing strategies for selecting a target node among candidates.
//!
//! Three strategies are exposed by name: `round_robin`, `least_loaded`, and
//! `hash_based`. All are thread-safe through atomics and concurrent maps,
//! and all honor health marks set by the router on RPC failures.

use crate::cache::quantized_hash;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    HashBased,
}

impl FromStr for BalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(BalanceStrategy::RoundRobin),
            "least_loaded" => Ok(BalanceStrategy::LeastLoaded),
            "hash_based" => Ok(BalanceStrategy::HashBased),
            other => Err(format!("unknown load balance strategy: {other}")),
        }
    }
}

/// Builds the balancer selected by `strategy`.
pub fn make_balancer(strategy: BalanceStrategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        BalanceStrategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        BalanceStrategy::LeastLoaded => Arc::new(LeastLoadedBalancer::new()),
        BalanceStrategy::HashBased => Arc::new(HashBasedBalancer::new()),
    }
}

/// Node selection among replica candidates.
pub trait LoadBalancer: Send + Sync {
    /// Picks a node id from `candidates` for the given query vector.
    /// Returns `None` only when `candidates` is empty.
    fn select(&self, candidates: &[String], query: &[f32]) -> Option<String>;

    /// Records the observed latency of a request to `node`.
    fn record_latency(&self, node: &str, latency: Duration);

    /// Marks a node unhealthy; it is avoided until marked healthy again.
    fn mark_unhealthy(&self, node: &str);

    /// Clears an unhealthy mark.
    fn mark_healthy(&self, node: &str);
}

fn healthy_candidates<'a>(
    candidates: &'a [String],
    unhealthy: &DashMap<String, Instant>,
    hold: Duration,
) -> Vec<&'a String> {
    let healthy: Vec<&String> = candidates
        .iter()
        .filter(|c| match unhealthy.get(c.as_str()) {
            Some(marked) => marked.elapsed() > hold,
            None => true,
        })
        .collect();
    // With every candidate marked down, trying them all beats failing.
    if healthy.is_empty() {
        candidates.iter().collect()
    } else {
        healthy
    }
}

// =============================================================================
// Round-robin
// =============================================================================

/// Rotates through candidates with an atomic cursor.
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
    unhealthy: DashMap<String, Instant>,
    unhealthy_hold: Duration,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            unhealthy: DashMap::new(),
            unhealthy_hold: Duration::from_secs(30),
        }
    }

    pub fn with_unhealthy_hold(mut self, hold: Duration) -> Self {
        self.unhealthy_hold = hold;
        self
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, candidates: &[String], _query: &[f32]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let pool = healthy_candidates(candidates, &self.unhealthy, self.unhealthy_hold);
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(pool[idx].clone())
    }

    fn record_latency(&self, _node: &str, _latency: Duration) {}

    fn mark_unhealthy(&self, node: &str) {
        self.unhealthy.insert(node.to_string(), Instant::now());
    }

    fn mark_healthy(&self, node: &str) {
        self.unhealthy.remove(node);
    }
}

// =============================================================================
// Least-loaded
// =============================================================================

struct NodeLoad {
    /// Requests currently in flight.
    inflight: AtomicI64,
    /// Exponential moving average of latency, microseconds.
    ema_latency_us: AtomicU64,
}

impl NodeLoad {
    fn new() -> Self {
        Self {
            inflight: AtomicI64::new(0),
            ema_latency_us: AtomicU64::new(1000),
        }
    }
}

/// Prefers the node with the fewest in-flight requests, breaking ties by
/// smoothed latency.
pub struct LeastLoadedBalancer {
    loads: DashMap<String, NodeLoad>,
    unhealthy: DashMap<String, Instant>,
    unhealthy_hold: Duration,
    /// EMA weight for new latency samples.
    alpha: f64,
}

impl LeastLoadedBalancer {
    pub fn new() -> Self {
        Self {
            loads: DashMap::new(),
            unhealthy: DashMap::new(),
            unhealthy_hold: Duration::from_secs(30),
            alpha: 0.3,
        }
    }

    /// Tracks the start of a request to `node`.
    pub fn begin_request(&self, node: &str) {
        self.loads
            .entry(node.to_string())
            .or_insert_with(NodeLoad::new)
            .inflight
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Tracks the end of a request to `node`.
    pub fn end_request(&self, node: &str) {
        if let Some(load) = self.loads.get(node) {
            load.inflight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn score(&self, node: &str) -> (i64, u64) {
        match self.loads.get(node) {
            Some(load) => (
                load.inflight.load(Ordering::Relaxed),
                load.ema_latency_us.load(Ordering::Relaxed),
            ),
            None => (0, 1000),
        }
    }
}

impl Default for LeastLoadedBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastLoadedBalancer {
    fn select(&self, candidates: &[String], _query: &[f32]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let pool = healthy_candidates(candidates, &self.unhealthy, self.unhealthy_hold);
        pool.into_iter()
            .min_by_key(|node| self.score(node))
            .cloned()
    }

    fn record_latency(&self, node: &str, latency: Duration) {
        let entry = self
            .loads
            .entry(node.to_string())
            .or_insert_with(NodeLoad::new);
        let sample = latency.as_micros() as u64;
        let old = entry.ema_latency_us.load(Ordering::Relaxed);
        let new = (self.alpha * sample as f64 + (1.0 - self.alpha) * old as f64) as u64;
        entry.ema_latency_us.store(new, Ordering::Relaxed);
    }

    fn mark_unhealthy(&self, node: &str) {
        self.unhealthy.insert(node.to_string(), Instant::now());
    }

    fn mark_healthy(&self, node: &str) {
        self.unhealthy.remove(node);
    }
}

// =============================================================================
// Hash-based
// =============================================================================

/// Pins each query vector to a candidate by hashing it, so repeated queries
/// land on the same node and its caches stay warm.
pub struct HashBasedBalancer {
    unhealthy: DashMap<String, Instant>,
    unhealthy_hold: Duration,
}

impl HashBasedBalancer {
    pub fn new() -> Self {
        Self {
            unhealthy: DashMap::new(),
            unhealthy_hold: Duration::from_secs(30),
        }
    }
}

impl Default for HashBasedBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for HashBasedBalancer {
    fn select(&self, candidates: &[String], query: &[f32]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let pool = healthy_candidates(candidates, &self.unhealthy, self.unhealthy_hold);
        let idx = (quantized_hash(query) % pool.len() as u64) as usize;
        Some(pool[idx].clone())
    }

    fn record_latency(&self, _node: &str, _latency: Duration) {}

    fn mark_unhealthy(&self, node: &str) {
        self.unhealthy.insert(node.to_string(), Instant::now());
    }

    fn mark_healthy(&self, node: &str) {
        self.unhealthy.remove(node);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "round_robin".parse::<BalanceStrategy>().unwrap(),
            BalanceStrategy::RoundRobin
        );
        assert_eq!(
            "least_loaded".parse::<BalanceStrategy>().unwrap(),
            BalanceStrategy::LeastLoaded
        );
        assert_eq!(
            "hash_based".parse::<BalanceStrategy>().unwrap(),
            BalanceStrategy::HashBased
        );
        assert!("random".parse::<BalanceStrategy>().is_err());
    }

    #[test]
    fn test_round_robin_rotates() {
        let balancer = RoundRobinBalancer::new();
        let candidates = nodes(&["a", "b", "c"]);
        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select(&candidates, &[]).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let balancer = RoundRobinBalancer::new();
        let candidates = nodes(&["a", "b"]);
        balancer.mark_unhealthy("a");
        for _ in 0..4 {
            assert_eq!(balancer.select(&candidates, &[]).unwrap(), "b");
        }
        balancer.mark_healthy("a");
        let picks: Vec<String> = (0..4)
            .map(|_| balancer.select(&candidates, &[]).unwrap())
            .collect();
        assert!(picks.iter().any(|p| p == "a"));
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_all() {
        let balancer = RoundRobinBalancer::new();
        let candidates = nodes(&["a"]);
        balancer.mark_unhealthy("a");
        assert_eq!(balancer.select(&candidates, &[]).unwrap(), "a");
    }

    #[test]
    fn test_empty_candidates() {
        let balancer = RoundRobinBalancer::new();
        assert!(balancer.select(&[], &[]).is_none());
    }

    #[test]
    fn test_least_loaded_prefers_idle() {
        let balancer = LeastLoadedBalancer::new();
        let candidates = nodes(&["busy", "idle"]);
        balancer.begin_request("busy");
        balancer.begin_request("busy");
        assert_eq!(balancer.select(&candidates, &[]).unwrap(), "idle");

        balancer.end_request("busy");
        balancer.end_request("busy");
        // Tied in-flight: latency decides.
        balancer.record_latency("busy", Duration::from_millis(50));
        balancer.record_latency("idle", Duration::from_micros(100));
        assert_eq!(balancer.select(&candidates, &[]).unwrap(), "idle");
    }

    #[test]
    fn test_hash_based_stable() {
        let balancer = HashBasedBalancer::new();
        let candidates = nodes(&["a", "b", "c"]);
        let query = [0.25, -0.5, 1.0];
        let first = balancer.select(&candidates, &query).unwrap();
        for _ in 0..10 {
            assert_eq!(balancer.select(&candidates, &query).unwrap(), first);
        }
    }

    #[test]
    fn test_hash_based_spreads() {
        let balancer = HashBasedBalancer::new();
        let candidates = nodes(&["a", "b", "c", "d"]);
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let query = [i as f32, (i * 7) as f32];
            seen.insert(balancer.select(&candidates, &query).unwrap());
        }
        assert!(seen.len() > 1);
    }
}
