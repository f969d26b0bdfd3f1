//! Bounded TTL LRU cache
//!
//! The same store backs the leaf-certificate cache, the fingerprint result
//! cache and the pattern result cache.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

struct Entry<V> {
  value: V,
  inserted: Instant,
}

struct CacheShared<K: Hash + Eq, V> {
  map: Mutex<LruCache<K, Entry<V>>>,
  ttl: Duration,
  capacity: usize,
  hits: AtomicU64,
  misses: AtomicU64,
}

/// A thread-safe LRU cache whose entries expire `ttl` after insertion.
///
/// `get` refreshes recency, never freshness: an entry inserted at `t` is gone
/// for every reader after `t + ttl` regardless of how often it was hit.
pub struct TtlCache<K: Hash + Eq, V: Clone> {
  shared: Arc<CacheShared<K, V>>,
}

impl<K: Hash + Eq, V: Clone> Clone for TtlCache<K, V> {
  fn clone(&self) -> Self {
    TtlCache {
      shared: Arc::clone(&self.shared),
    }
  }
}

/// Counter snapshot of a [`TtlCache`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
  /// Configured capacity
  pub capacity: usize,
  /// Live entries, expired or not
  pub len: usize,
  /// Unexpired lookups
  pub hits: u64,
  /// Absent or expired lookups
  pub misses: u64,
  /// Entry TTL in seconds
  pub ttl_secs: u64,
}

impl CacheStats {
  /// Fraction of lookups answered from the cache.
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
  /// Create a cache holding at most `capacity` entries for at most `ttl`.
  pub fn new(capacity: usize, ttl: Duration) -> Self {
    let capacity = capacity.max(1);
    TtlCache {
      shared: Arc::new(CacheShared {
        map: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        ttl,
        capacity,
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
      }),
    }
  }

  /// Fetch an unexpired value, refreshing its recency. Expired entries are
  /// removed and reported as misses.
  pub fn get(&self, key: &K) -> Option<V> {
    let mut map = self.shared.map.lock().unwrap();
    let expired = match map.get(key) {
      Some(entry) => {
        if entry.inserted.elapsed() < self.shared.ttl {
          self.shared.hits.fetch_add(1, Ordering::Relaxed);
          return Some(entry.value.clone());
        }
        true
      }
      None => false,
    };
    if expired {
      map.pop(key);
    }
    self.shared.misses.fetch_add(1, Ordering::Relaxed);
    None
  }

  /// Insert a value, evicting the least recently used entry over capacity.
  pub fn put(&self, key: K, value: V) {
    let mut map = self.shared.map.lock().unwrap();
    map.put(
      key,
      Entry {
        value,
        inserted: Instant::now(),
      },
    );
  }

  /// Remove an entry, returning its value.
  pub fn remove(&self, key: &K) -> Option<V> {
    self.shared.map.lock().unwrap().pop(key).map(|e| e.value)
  }

  /// Drop every entry.
  pub fn clear(&self) {
    self.shared.map.lock().unwrap().clear();
  }

  /// Number of live entries, expired or not.
  pub fn len(&self) -> usize {
    self.shared.map.lock().unwrap().len()
  }

  /// Whether the cache holds no entries.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Counter snapshot.
  pub fn stats(&self) -> CacheStats {
    CacheStats {
      capacity: self.shared.capacity,
      len: self.len(),
      hits: self.shared.hits.load(Ordering::Relaxed),
      misses: self.shared.misses.load(Ordering::Relaxed),
      ttl_secs: self.shared.ttl.as_secs(),
    }
  }
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
  /// Remove every entry whose TTL has elapsed, returning how many were
  /// dropped.
  pub fn purge_expired(&self) -> usize {
    let mut map = self.shared.map.lock().unwrap();
    let ttl = self.shared.ttl;
    let expired: Vec<K> = map
      .iter()
      .filter(|(_, entry)| entry.inserted.elapsed() >= ttl)
      .map(|(key, _)| key.clone())
      .collect();
    for key in &expired {
      map.pop(key);
    }
    expired.len()
  }
}

impl<K, V> TtlCache<K, V>
where
  K: Hash + Eq + Clone + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  /// Spawn a background scavenger removing expired entries every `interval`.
  ///
  /// The task ends when the last cache handle is dropped.
  pub fn spawn_scavenger(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
    let weak: Weak<CacheShared<K, V>> = Arc::downgrade(&self.shared);
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        match weak.upgrade() {
          Some(shared) => {
            let cache = TtlCache { shared };
            let cleaned = cache.purge_expired();
            if cleaned > 0 {
              tracing::debug!("[cache] scavenged {} expired entries", cleaned);
            }
          }
          None => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hit_refreshes_recency() {
    let cache: TtlCache<&str, u32> = TtlCache::new(2, Duration::from_secs(60));
    cache.put("a", 1);
    cache.put("b", 2);
    assert_eq!(cache.get(&"a"), Some(1));
    // "b" is now least recently used and falls out first.
    cache.put("c", 3);
    assert_eq!(cache.get(&"b"), None);
    assert_eq!(cache.get(&"a"), Some(1));
    assert_eq!(cache.get(&"c"), Some(3));
  }

  #[test]
  fn expired_entry_is_a_miss() {
    let cache: TtlCache<&str, u32> = TtlCache::new(8, Duration::from_millis(10));
    cache.put("a", 1);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(cache.get(&"a"), None);
    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.len, 0);
  }

  #[test]
  fn purge_removes_only_expired() {
    let cache: TtlCache<String, u32> = TtlCache::new(8, Duration::from_millis(30));
    cache.put("old".to_string(), 1);
    std::thread::sleep(Duration::from_millis(40));
    cache.put("fresh".to_string(), 2);
    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.get(&"fresh".to_string()), Some(2));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn capacity_bound_holds() {
    let cache: TtlCache<u32, u32> = TtlCache::new(4, Duration::from_secs(60));
    for i in 0..100 {
      cache.put(i, i);
    }
    assert_eq!(cache.len(), 4);
  }
}
