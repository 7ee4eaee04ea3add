use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::CacheBackend;

/// Share of entries dropped when the cache is full.
const PRUNE_FRACTION: f64 = 0.10;

#[derive(Debug)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
    /// Milliseconds since the cache was created at the last read.
    hit_at: AtomicU64,
}

/// In-process cache: TTL per entry, tag index for bulk invalidation, and
/// least-recently-hit pruning once `max_entries` is reached.
#[derive(Debug)]
pub struct MemoryCache {
    max_entries: usize,
    epoch: Instant,
    entries: DashMap<String, CacheEntry>,
    tags: DashMap<String, HashSet<String>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            epoch: Instant::now(),
            entries: DashMap::new(),
            tags: DashMap::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Drop the least recently hit entries.
    fn prune(&self) -> usize {
        let n_to_prune = ((self.entries.len() as f64 * PRUNE_FRACTION).ceil() as usize).max(1);

        // max-heap on hit time keeps the `n_to_prune` oldest hits
        let mut heap: BinaryHeap<(u64, String)> = BinaryHeap::with_capacity(n_to_prune + 1);
        for entry in self.entries.iter() {
            let hit_at = entry.value().hit_at.load(Ordering::Relaxed);
            if heap.len() < n_to_prune {
                heap.push((hit_at, entry.key().clone()));
            } else if heap.peek().is_some_and(|(top, _)| hit_at < *top) {
                heap.pop();
                heap.push((hit_at, entry.key().clone()));
            }
        }

        let pruned = heap.len();
        for (_, key) in heap {
            self.entries.remove(&key);
        }
        pruned
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let expired = {
            let entry = self.entries.get(key)?;
            if entry.expires_at > Instant::now() {
                entry.hit_at.store(self.now_ms(), Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            true
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: Bytes, ttl: Duration, tags: &[String]) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            if self.purge_expired() == 0 {
                self.prune();
            }
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                hit_at: AtomicU64::new(self.now_ms()),
            },
        );
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn invalidate_tag(&self, tag: &str) -> usize {
        let Some((_, keys)) = self.tags.remove(tag) else {
            return 0;
        };
        keys.iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count()
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());

        // drop index references to keys that no longer exist
        self.tags.retain(|_, keys| {
            keys.retain(|key| self.entries.contains_key(key));
            !keys.is_empty()
        });

        purged
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn get_returns_live_entries() {
        let cache = MemoryCache::new(10);
        cache.set("a", Bytes::from_static(b"1"), Duration::from_secs(60), &[]);
        assert_eq!(cache.get("a"), Some(Bytes::from_static(b"1")));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = MemoryCache::new(10);
        cache.set("a", Bytes::from_static(b"1"), Duration::ZERO, &[]);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn tag_invalidation_removes_every_tagged_entry() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.set("novel:info:1", Bytes::from_static(b"i"), ttl, &tags(&["novel:1"]));
        cache.set("chapter:9", Bytes::from_static(b"c"), ttl, &tags(&["novel:1"]));
        cache.set("novel:info:2", Bytes::from_static(b"j"), ttl, &tags(&["novel:2"]));

        assert_eq!(cache.invalidate_tag("novel:1"), 2);
        assert_eq!(cache.get("novel:info:1"), None);
        assert_eq!(cache.get("chapter:9"), None);
        assert!(cache.get("novel:info:2").is_some());
        assert_eq!(cache.invalidate_tag("novel:1"), 0);
    }

    #[test]
    fn full_cache_prunes_least_recently_hit() {
        let cache = MemoryCache::new(3);
        let ttl = Duration::from_secs(60);
        cache.set("a", Bytes::from_static(b"a"), ttl, &[]);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("b", Bytes::from_static(b"b"), ttl, &[]);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("c", Bytes::from_static(b"c"), ttl, &[]);
        std::thread::sleep(Duration::from_millis(5));
        cache.get("a");

        cache.set("d", Bytes::from_static(b"d"), ttl, &[]);
        assert_eq!(cache.len(), 3);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn purge_cleans_tag_index() {
        let cache = MemoryCache::new(10);
        cache.set("x", Bytes::from_static(b"x"), Duration::ZERO, &tags(&["t"]));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.tags.is_empty());
    }
}
