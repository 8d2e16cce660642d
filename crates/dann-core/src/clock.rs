//! Vector clocks for causality tracking between replicas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mapping from node id to event counter.
///
/// Induces a partial order on events: `a.happens_before(b)` iff every entry
/// of `a` is `<=` the corresponding entry of `b` and at least one is
/// strictly less. Two clocks are concurrent iff neither happens before the
/// other. A `BTreeMap` keeps iteration deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances this node's counter by one.
    pub fn increment(&mut self, node_id: &str) {
        *self.entries.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Per-key max-merge of `other` into `self`.
    pub fn update(&mut self, other: &VectorClock) {
        for (node, &count) in &other.entries {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Returns the counter for `node_id`, zero if absent.
    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Strict partial order: every entry of `self` <= `other` and at least
    /// one strictly less. Absent entries count as zero.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for (node, &count) in &self.entries {
            let theirs = other.get(node);
            if count > theirs {
                return false;
            }
            if count < theirs {
                strictly_less = true;
            }
        }
        // Entries present only on the other side are strictly greater than
        // our implicit zero.
        for (node, &count) in &other.entries {
            if count > 0 && !self.entries.contains_key(node) {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// Neither clock happens before the other.
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(node_id, counter)` pairs in node-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (node, count) in pairs {
            for _ in 0..*count {
                c.increment(node);
            }
        }
        c
    }

    #[test]
    fn test_increment_and_get() {
        let mut c = VectorClock::new();
        assert_eq!(c.get("a"), 0);
        c.increment("a");
        c.increment("a");
        c.increment("b");
        assert_eq!(c.get("a"), 2);
        assert_eq!(c.get("b"), 1);
    }

    #[test]
    fn test_happens_before() {
        let a = clock(&[("n1", 1)]);
        let b = clock(&[("n1", 2)]);
        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));

        let c = clock(&[("n1", 1), ("n2", 1)]);
        assert!(a.happens_before(&c));
        assert!(!c.happens_before(&a));
    }

    #[test]
    fn test_happens_before_is_irreflexive() {
        let a = clock(&[("n1", 3), ("n2", 1)]);
        assert!(!a.happens_before(&a));
    }

    #[test]
    fn test_happens_before_is_antisymmetric() {
        let a = clock(&[("n1", 1), ("n2", 2)]);
        let b = clock(&[("n1", 2), ("n2", 2)]);
        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn test_happens_before_is_transitive() {
        let a = clock(&[("n1", 1)]);
        let b = clock(&[("n1", 1), ("n2", 1)]);
        let c = clock(&[("n1", 2), ("n2", 2)]);
        assert!(a.happens_before(&b));
        assert!(b.happens_before(&c));
        assert!(a.happens_before(&c));
    }

    #[test]
    fn test_concurrent() {
        let a = clock(&[("n1", 2), ("n2", 1)]);
        let b = clock(&[("n1", 1), ("n2", 2)]);
        assert!(a.is_concurrent(&b));
        assert!(b.is_concurrent(&a));

        let c = clock(&[("n1", 2), ("n2", 2)]);
        assert!(!a.is_concurrent(&c));
    }

    #[test]
    fn test_update_max_merge() {
        let mut a = clock(&[("n1", 2), ("n2", 1)]);
        let b = clock(&[("n1", 1), ("n2", 3), ("n3", 1)]);
        a.update(&b);
        assert_eq!(a.get("n1"), 2);
        assert_eq!(a.get("n2"), 3);
        assert_eq!(a.get("n3"), 1);
    }

    #[test]
    fn test_empty_clocks_not_ordered() {
        let a = VectorClock::new();
        let b = VectorClock::new();
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }
}
