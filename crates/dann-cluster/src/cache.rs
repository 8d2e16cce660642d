//! Query result cache with LRU eviction and TTL expiry.
//!
//! Keys quantize the query vector before hashing, so queries that differ
//! only in float noise below three decimal places share an entry.

use dann_core::SearchResult;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Counters describing cache behavior.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
}

impl CacheStats {
    /// Hit rate as a fraction in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache key: quantized query hash plus k.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryCacheKey {
    query_hash: u64,
    k: usize,
}

impl QueryCacheKey {
    fn new(query: &[f32], k: usize) -> Self {
        Self {
            query_hash: quantized_hash(query),
            k,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    results: Vec<SearchResult>,
    created_at: Instant,
}

/// Bounded LRU cache of query responses.
pub struct QueryCache {
    cache: LruCache<QueryCacheKey, CachedEntry>,
    ttl: Duration,
    stats: CacheStats,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Returns the cached results for `(query, k)`, dropping and missing on
    /// expired entries.
    pub fn get(&mut self, query: &[f32], k: usize) -> Option<Vec<SearchResult>> {
        let key = QueryCacheKey::new(query, k);
        match self.cache.get(&key) {
            Some(entry) => {
                if entry.created_at.elapsed() > self.ttl {
                    self.cache.pop(&key);
                    self.stats.expirations += 1;
                    self.stats.misses += 1;
                    self.stats.size = self.cache.len();
                    None
                } else {
                    self.stats.hits += 1;
                    Some(entry.results.clone())
                }
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Caches a result, evicting the least recently used entry when full.
    pub fn put(&mut self, query: &[f32], k: usize, results: Vec<SearchResult>) {
        let key = QueryCacheKey::new(query, k);
        let was_full = self.cache.len() >= self.cache.cap().get();
        let replaced = self.cache.put(
            key,
            CachedEntry {
                results,
                created_at: Instant::now(),
            },
        );
        if was_full && replaced.is_none() {
            self.stats.evictions += 1;
        }
        self.stats.size = self.cache.len();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.stats.size = 0;
    }

    /// Drops every expired entry. O(n); meant for a periodic sweep, not the
    /// hot path.
    pub fn evict_expired(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<QueryCacheKey> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.cache.pop(&key);
            self.stats.expirations += 1;
        }
        self.stats.size = self.cache.len();
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("size", &self.cache.len())
            .field("capacity", &self.cache.cap())
            .field("ttl", &self.ttl)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Hashes a query vector after rounding to three decimal places.
pub fn quantized_hash(vector: &[f32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for &v in vector {
        let quantized = (v * 1000.0).round() as i64;
        quantized.hash(&mut hasher);
    }
    hasher.finish()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dann_core::VectorId;

    fn results(ids: &[i64]) -> Vec<SearchResult> {
        ids.iter()
            .map(|&id| SearchResult::new(VectorId(id), id as f32))
            .collect()
    }

    #[test]
    fn test_put_get() {
        let mut cache = QueryCache::new(16, Duration::from_secs(60));
        let query = vec![1.0, 0.0];

        assert!(cache.get(&query, 5).is_none());
        cache.put(&query, 5, results(&[1, 2]));
        assert_eq!(cache.get(&query, 5), Some(results(&[1, 2])));
    }

    #[test]
    fn test_key_includes_k() {
        let mut cache = QueryCache::new(16, Duration::from_secs(60));
        let query = vec![1.0, 0.0];
        cache.put(&query, 5, results(&[1]));
        cache.put(&query, 10, results(&[1, 2]));
        assert_eq!(cache.get(&query, 5).unwrap().len(), 1);
        assert_eq!(cache.get(&query, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = QueryCache::new(2, Duration::from_secs(60));
        let q1 = vec![1.0];
        let q2 = vec![2.0];
        let q3 = vec![3.0];

        cache.put(&q1, 1, results(&[1]));
        cache.put(&q2, 1, results(&[2]));
        let _ = cache.get(&q1, 1);
        cache.put(&q3, 1, results(&[3]));

        assert!(cache.get(&q1, 1).is_some());
        assert!(cache.get(&q2, 1).is_none());
        assert!(cache.get(&q3, 1).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = QueryCache::new(16, Duration::from_millis(1));
        let query = vec![1.0];
        cache.put(&query, 1, results(&[1]));
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&query, 1).is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_evict_expired_sweep() {
        let mut cache = QueryCache::new(16, Duration::from_millis(1));
        cache.put(&[1.0], 1, results(&[1]));
        cache.put(&[2.0], 1, results(&[2]));
        std::thread::sleep(Duration::from_millis(10));
        cache.evict_expired();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_quantized_hash_tolerance() {
        // Differences below the quantization step share a hash.
        assert_eq!(
            quantized_hash(&[1.0, 0.0]),
            quantized_hash(&[1.0001, 0.0001])
        );
        assert_ne!(quantized_hash(&[1.0, 0.0]), quantized_hash(&[0.0, 1.0]));
    }

    #[test]
    fn test_stats_hit_rate() {
        let mut cache = QueryCache::new(16, Duration::from_secs(60));
        let query = vec![1.0];
        let _ = cache.get(&query, 1);
        cache.put(&query, 1, results(&[1]));
        let _ = cache.get(&query, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
        assert!((cache.stats().hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clear() {
        let mut cache = QueryCache::new(16, Duration::from_secs(60));
        cache.put(&[1.0], 1, results(&[1]));
        cache.clear();
        assert!(cache.is_empty());
    }
}
