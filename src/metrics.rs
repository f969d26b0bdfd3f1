//! Atomic traffic counters and health probes
//!
//! The engine only records and snapshots; serving the numbers over HTTP is
//! the embedding binary's concern.

use crate::arena::BufferArena;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const DURATION_RING_CAPACITY: usize = 1000;

/// Shared traffic counters. Cloning hands out another handle to the same
/// counters.
#[derive(Clone)]
pub struct Metrics {
  shared: Arc<MetricsShared>,
}

struct MetricsShared {
  start: Instant,
  requests: AtomicU64,
  responses: AtomicU64,
  errors: AtomicU64,
  active_connections: AtomicI64,
  total_connections: AtomicU64,
  bytes_in: AtomicU64,
  bytes_out: AtomicU64,
  status_codes: Mutex<HashMap<u16, u64>>,
  durations: Mutex<DurationRing>,
}

struct DurationRing {
  samples: VecDeque<Duration>,
  min: Option<Duration>,
  max: Duration,
}

impl Default for Metrics {
  fn default() -> Self {
    Self::new()
  }
}

impl Metrics {
  /// Create a fresh set of counters.
  pub fn new() -> Self {
    Metrics {
      shared: Arc::new(MetricsShared {
        start: Instant::now(),
        requests: AtomicU64::new(0),
        responses: AtomicU64::new(0),
        errors: AtomicU64::new(0),
        active_connections: AtomicI64::new(0),
        total_connections: AtomicU64::new(0),
        bytes_in: AtomicU64::new(0),
        bytes_out: AtomicU64::new(0),
        status_codes: Mutex::new(HashMap::new()),
        durations: Mutex::new(DurationRing {
          samples: VecDeque::with_capacity(DURATION_RING_CAPACITY),
          min: None,
          max: Duration::ZERO,
        }),
      }),
    }
  }

  /// Count an accepted connection.
  pub fn connection_opened(&self) {
    self.shared.active_connections.fetch_add(1, Ordering::Relaxed);
    self.shared.total_connections.fetch_add(1, Ordering::Relaxed);
  }

  /// Count a finished connection.
  pub fn connection_closed(&self) {
    self.shared.active_connections.fetch_sub(1, Ordering::Relaxed);
  }

  /// Currently open connections.
  pub fn active_connections(&self) -> i64 {
    self.shared.active_connections.load(Ordering::Relaxed)
  }

  /// Count a decoded request and its inbound bytes.
  pub fn record_request(&self, bytes: u64) {
    self.shared.requests.fetch_add(1, Ordering::Relaxed);
    self.shared.bytes_in.fetch_add(bytes, Ordering::Relaxed);
  }

  /// Count a forwarded response, its outbound bytes and its latency.
  pub fn record_response(&self, status: u16, bytes: u64, elapsed: Duration) {
    self.shared.responses.fetch_add(1, Ordering::Relaxed);
    self.shared.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    *self
      .shared
      .status_codes
      .lock()
      .unwrap()
      .entry(status)
      .or_insert(0) += 1;
    let mut ring = self.shared.durations.lock().unwrap();
    if ring.samples.len() >= DURATION_RING_CAPACITY {
      ring.samples.pop_front();
    }
    ring.samples.push_back(elapsed);
    if elapsed > ring.max {
      ring.max = elapsed;
    }
    match ring.min {
      Some(min) if elapsed >= min => {}
      _ => ring.min = Some(elapsed),
    }
  }

  /// Count a failed exchange.
  pub fn record_error(&self) {
    self.shared.errors.fetch_add(1, Ordering::Relaxed);
  }

  /// Count raw spliced bytes, for tunnelled traffic outside the HTTP path.
  pub fn record_transfer(&self, bytes_in: u64, bytes_out: u64) {
    self.shared.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
    self.shared.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
  }

  /// Read-only snapshot of every counter.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let s = &self.shared;
    let uptime = s.start.elapsed();
    let requests = s.requests.load(Ordering::Relaxed);
    let status_codes = s.status_codes.lock().unwrap().clone();
    let ring = s.durations.lock().unwrap();
    let avg = if ring.samples.is_empty() {
      Duration::ZERO
    } else {
      ring.samples.iter().sum::<Duration>() / ring.samples.len() as u32
    };
    MetricsSnapshot {
      uptime_secs: uptime.as_secs(),
      requests,
      responses: s.responses.load(Ordering::Relaxed),
      errors: s.errors.load(Ordering::Relaxed),
      active_connections: s.active_connections.load(Ordering::Relaxed),
      total_connections: s.total_connections.load(Ordering::Relaxed),
      bytes_in: s.bytes_in.load(Ordering::Relaxed),
      bytes_out: s.bytes_out.load(Ordering::Relaxed),
      requests_per_sec: requests as f64 / uptime.as_secs_f64().max(f64::EPSILON),
      avg_response_ms: avg.as_secs_f64() * 1000.0,
      min_response_ms: ring.min.unwrap_or(Duration::ZERO).as_secs_f64() * 1000.0,
      max_response_ms: ring.max.as_secs_f64() * 1000.0,
      status_codes,
    }
  }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
  /// Seconds since the counters were created
  pub uptime_secs: u64,
  /// Decoded requests
  pub requests: u64,
  /// Forwarded responses
  pub responses: u64,
  /// Failed exchanges
  pub errors: u64,
  /// Currently open connections
  pub active_connections: i64,
  /// Connections accepted since start
  pub total_connections: u64,
  /// Bytes read from clients
  pub bytes_in: u64,
  /// Bytes written to clients
  pub bytes_out: u64,
  /// Requests divided by uptime
  pub requests_per_sec: f64,
  /// Mean latency over the sample ring
  pub avg_response_ms: f64,
  /// Smallest observed latency
  pub min_response_ms: f64,
  /// Largest observed latency
  pub max_response_ms: f64,
  /// Response count per status code
  pub status_codes: HashMap<u16, u64>,
}

/// A single health probe.
pub trait HealthCheck: Send + Sync {
  /// Probe name reported in the status document.
  fn name(&self) -> &str;
  /// `Err` carries the failure description.
  fn check(&self) -> std::result::Result<(), String>;
}

/// An ordered set of health probes.
#[derive(Default)]
pub struct HealthRegistry {
  checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
}

/// Aggregated probe outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
  /// Whether every probe passed
  pub healthy: bool,
  /// Probe name to `OK` or `FAIL: <reason>`
  pub checks: Vec<(String, String)>,
}

impl HealthRegistry {
  /// Create an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a probe.
  pub fn add(&self, check: Arc<dyn HealthCheck>) {
    self.checks.write().unwrap().push(check);
  }

  /// Remove a probe by name.
  pub fn remove(&self, name: &str) {
    self.checks.write().unwrap().retain(|c| c.name() != name);
  }

  /// Run every probe.
  pub fn check_health(&self) -> HealthStatus {
    let checks = self.checks.read().unwrap().clone();
    let mut healthy = true;
    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
      match check.check() {
        Ok(()) => results.push((check.name().to_string(), "OK".to_string())),
        Err(reason) => {
          healthy = false;
          results.push((check.name().to_string(), format!("FAIL: {}", reason)));
        }
      }
    }
    HealthStatus {
      healthy,
      checks: results,
    }
  }
}

/// Fails when a sampled gauge exceeds its ceiling. The sampler is supplied by
/// the caller, which keeps memory and task probes portable.
pub struct CeilingCheck {
  name: String,
  ceiling: u64,
  sample: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl CeilingCheck {
  /// Create a ceiling probe over `sample`.
  pub fn new(
    name: impl Into<String>,
    ceiling: u64,
    sample: impl Fn() -> u64 + Send + Sync + 'static,
  ) -> Self {
    Self {
      name: name.into(),
      ceiling,
      sample: Box::new(sample),
    }
  }
}

impl HealthCheck for CeilingCheck {
  fn name(&self) -> &str {
    &self.name
  }

  fn check(&self) -> std::result::Result<(), String> {
    let value = (self.sample)();
    if value > self.ceiling {
      Err(format!("{} exceeds ceiling {}", value, self.ceiling))
    } else {
      Ok(())
    }
  }
}

/// Fails when the buffer arena hit rate drops below a floor. Quiet arenas
/// with fewer than `min_samples` acquisitions always pass.
pub struct ArenaHitRateCheck {
  arena: BufferArena,
  floor: f64,
  min_samples: u64,
}

impl ArenaHitRateCheck {
  /// Create a hit-rate probe over `arena`.
  pub fn new(arena: BufferArena, floor: f64, min_samples: u64) -> Self {
    Self {
      arena,
      floor,
      min_samples,
    }
  }
}

impl HealthCheck for ArenaHitRateCheck {
  fn name(&self) -> &str {
    "buffer_pool_hit_rate"
  }

  fn check(&self) -> std::result::Result<(), String> {
    let stats = self.arena.stats();
    if stats.allocations < self.min_samples {
      return Ok(());
    }
    let rate = stats.hit_rate();
    if rate < self.floor {
      Err(format!("hit rate {:.2} below floor {:.2}", rate, self.floor))
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn latency_ring_is_bounded() {
    let metrics = Metrics::new();
    for i in 0..(DURATION_RING_CAPACITY + 100) {
      metrics.record_response(200, 10, Duration::from_millis(i as u64 % 50 + 1));
    }
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.responses, (DURATION_RING_CAPACITY + 100) as u64);
    assert_eq!(snapshot.status_codes.get(&200).copied().unwrap(), snapshot.responses);
    assert!(snapshot.min_response_ms >= 1.0);
    assert!(snapshot.max_response_ms <= 50.0);
    let ring = metrics.shared.durations.lock().unwrap();
    assert_eq!(ring.samples.len(), DURATION_RING_CAPACITY);
  }

  #[test]
  fn connection_gauge() {
    let metrics = Metrics::new();
    metrics.connection_opened();
    metrics.connection_opened();
    metrics.connection_closed();
    assert_eq!(metrics.active_connections(), 1);
    assert_eq!(metrics.snapshot().total_connections, 2);
  }

  #[test]
  fn ceiling_check_trips() {
    let check = CeilingCheck::new("tasks", 10, || 11);
    assert!(check.check().is_err());
    let check = CeilingCheck::new("tasks", 10, || 10);
    assert!(check.check().is_ok());
  }

  #[test]
  fn registry_aggregates() {
    let registry = HealthRegistry::new();
    registry.add(Arc::new(CeilingCheck::new("a", 1, || 0)));
    registry.add(Arc::new(CeilingCheck::new("b", 1, || 2)));
    let status = registry.check_health();
    assert!(!status.healthy);
    assert_eq!(status.checks.len(), 2);
    registry.remove("b");
    assert!(registry.check_health().healthy);
  }
}
