//! Size-bucketed reusable byte buffers
//!
//! Body copies draw scratch buffers from here instead of allocating per
//! exchange. Buffers return to their bucket on drop, zeroed.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const MIN_CLASS: usize = 1024;
const MAX_CLASS: usize = 4 * 1024 * 1024;
// Buckets accept up to twice the retention cap between maintenance passes.
const RETAIN_PER_BUCKET: usize = 32;

/// A pool of reusable byte buffers bucketed by power-of-two size classes
/// from 1 KiB to 4 MiB.
#[derive(Clone)]
pub struct BufferArena {
  shared: Arc<ArenaShared>,
}

struct ArenaShared {
  classes: Vec<usize>,
  buckets: Vec<Mutex<Vec<Vec<u8>>>>,
  allocations: AtomicU64,
  releases: AtomicU64,
  hits: AtomicU64,
  misses: AtomicU64,
  bytes_outstanding: AtomicI64,
}

/// Counter snapshot of a [`BufferArena`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ArenaStats {
  /// Total `acquire` calls
  pub allocations: u64,
  /// Total buffers returned
  pub releases: u64,
  /// Buffers served from a bucket
  pub hits: u64,
  /// Buffers minted fresh
  pub misses: u64,
  /// Bytes currently checked out
  pub bytes_outstanding: i64,
}

impl ArenaStats {
  /// Fraction of acquisitions served from a bucket.
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// A buffer checked out of a [`BufferArena`]. Dereferences to `Vec<u8>`;
/// returning it to its bucket happens on drop.
pub struct ArenaBuf {
  data: Vec<u8>,
  class: Option<usize>,
  charged: usize,
  shared: Arc<ArenaShared>,
}

impl Default for BufferArena {
  fn default() -> Self {
    Self::new()
  }
}

impl BufferArena {
  /// Create an arena with the default size classes.
  pub fn new() -> Self {
    let mut classes = Vec::new();
    let mut size = MIN_CLASS;
    while size <= MAX_CLASS {
      classes.push(size);
      size *= 2;
    }
    let buckets = classes.iter().map(|_| Mutex::new(Vec::new())).collect();
    BufferArena {
      shared: Arc::new(ArenaShared {
        classes,
        buckets,
        allocations: AtomicU64::new(0),
        releases: AtomicU64::new(0),
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
        bytes_outstanding: AtomicI64::new(0),
      }),
    }
  }

  /// Check out a zeroed buffer of at least `size` bytes.
  ///
  /// Sizes above the largest class are satisfied by a fresh allocation that
  /// is never pooled.
  pub fn acquire(&self, size: usize) -> ArenaBuf {
    let shared = &self.shared;
    shared.allocations.fetch_add(1, Ordering::Relaxed);
    let class_idx = shared.classes.iter().position(|&c| c >= size);
    let (data, class) = match class_idx {
      Some(idx) => {
        let class = shared.classes[idx];
        let pooled = shared.buckets[idx].lock().unwrap().pop();
        match pooled {
          Some(buf) => {
            shared.hits.fetch_add(1, Ordering::Relaxed);
            (buf, Some(class))
          }
          None => {
            shared.misses.fetch_add(1, Ordering::Relaxed);
            (vec![0u8; class], Some(class))
          }
        }
      }
      None => {
        shared.misses.fetch_add(1, Ordering::Relaxed);
        (vec![0u8; size], None)
      }
    };
    let charged = data.len();
    shared
      .bytes_outstanding
      .fetch_add(charged as i64, Ordering::Relaxed);
    ArenaBuf {
      data,
      class,
      charged,
      shared: Arc::clone(shared),
    }
  }

  /// Counter snapshot.
  pub fn stats(&self) -> ArenaStats {
    let s = &self.shared;
    ArenaStats {
      allocations: s.allocations.load(Ordering::Relaxed),
      releases: s.releases.load(Ordering::Relaxed),
      hits: s.hits.load(Ordering::Relaxed),
      misses: s.misses.load(Ordering::Relaxed),
      bytes_outstanding: s.bytes_outstanding.load(Ordering::Relaxed),
    }
  }

  /// Drop pooled buffers above the retention cap in every bucket.
  pub fn drain_excess(&self) {
    for bucket in &self.shared.buckets {
      let mut bucket = bucket.lock().unwrap();
      bucket.truncate(RETAIN_PER_BUCKET);
      bucket.shrink_to_fit();
    }
  }

  /// Spawn a background task draining excess buffers every `interval`.
  ///
  /// The task ends when the arena is dropped.
  pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
    let weak: Weak<ArenaShared> = Arc::downgrade(&self.shared);
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        match weak.upgrade() {
          Some(shared) => {
            let arena = BufferArena { shared };
            arena.drain_excess();
          }
          None => break,
        }
      }
    })
  }
}

impl ArenaBuf {
  /// The size class this buffer belongs to, `None` for oversize buffers.
  pub fn class(&self) -> Option<usize> {
    self.class
  }
}

impl Deref for ArenaBuf {
  type Target = Vec<u8>;

  fn deref(&self) -> &Self::Target {
    &self.data
  }
}

impl DerefMut for ArenaBuf {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.data
  }
}

impl Drop for ArenaBuf {
  fn drop(&mut self) {
    let shared = &self.shared;
    shared.releases.fetch_add(1, Ordering::Relaxed);
    let mut data = std::mem::take(&mut self.data);
    shared
      .bytes_outstanding
      .fetch_sub(self.charged as i64, Ordering::Relaxed);
    if let Some(class) = self.class {
      data.resize(class, 0);
      data.fill(0);
      if let Some(idx) = shared.classes.iter().position(|&c| c == class) {
        let mut bucket = shared.buckets[idx].lock().unwrap();
        if bucket.len() < RETAIN_PER_BUCKET * 2 {
          bucket.push(data);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rounds_up_to_size_class() {
    let arena = BufferArena::new();
    let buf = arena.acquire(1500);
    assert_eq!(buf.class(), Some(2048));
    assert_eq!(buf.len(), 2048);
  }

  #[test]
  fn reuse_is_a_hit_and_zeroed() {
    let arena = BufferArena::new();
    {
      let mut buf = arena.acquire(1024);
      buf[0] = 0xAA;
    }
    let buf = arena.acquire(1024);
    assert_eq!(buf[0], 0);
    let stats = arena.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
  }

  #[test]
  fn oversize_is_never_pooled() {
    let arena = BufferArena::new();
    {
      let buf = arena.acquire(MAX_CLASS + 1);
      assert_eq!(buf.class(), None);
    }
    let stats = arena.stats();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.releases, 1);
    // A second oversize acquire must not hit a bucket.
    drop(arena.acquire(MAX_CLASS + 1));
    assert_eq!(arena.stats().hits, 0);
  }

  #[test]
  fn outstanding_matches_allocations_minus_releases() {
    let arena = BufferArena::new();
    let a = arena.acquire(4096);
    let b = arena.acquire(8192);
    let stats = arena.stats();
    assert_eq!(stats.allocations - stats.releases, 2);
    assert_eq!(stats.bytes_outstanding, 4096 + 8192);
    drop(a);
    drop(b);
    let stats = arena.stats();
    assert_eq!(stats.allocations - stats.releases, 0);
    assert_eq!(stats.bytes_outstanding, 0);
  }

  #[test]
  fn drain_bounds_bucket_depth() {
    let arena = BufferArena::new();
    let bufs: Vec<_> = (0..RETAIN_PER_BUCKET * 2).map(|_| arena.acquire(1024)).collect();
    drop(bufs);
    arena.drain_excess();
    let pooled = arena.shared.buckets[0].lock().unwrap().len();
    assert!(pooled <= RETAIN_PER_BUCKET);
  }
}
