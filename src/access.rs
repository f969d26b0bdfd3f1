//! IP filtering, proxy authentication and rate limiting

use crate::config::SecurityConfig;
use crate::errors::{Error, Result};
use base64::prelude::*;
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

/// Evaluates every inbound request against the blacklist, the whitelist,
/// proxy credentials and the sliding-window rate limit, in that order.
#[derive(Clone)]
pub struct AccessControl {
  shared: Arc<AccessShared>,
}

struct AccessShared {
  whitelist: RwLock<HashSet<String>>,
  blacklist: RwLock<HashSet<String>>,
  auth: RwLock<Option<AuthCredentials>>,
  limiter: RateLimiter,
}

struct AuthCredentials {
  username: String,
  password_digest: [u8; 32],
}

struct RateLimiter {
  enabled: bool,
  max_requests: usize,
  window: Duration,
  clients: Mutex<HashMap<String, ClientRecord>>,
}

struct ClientRecord {
  requests: Vec<Instant>,
  last_seen: Instant,
}

impl AccessControl {
  /// Build the controller from the security section of the configuration.
  pub fn new(config: &SecurityConfig) -> Self {
    let shared = AccessShared {
      whitelist: RwLock::new(config.whitelist.iter().cloned().collect()),
      blacklist: RwLock::new(config.blacklist.iter().cloned().collect()),
      auth: RwLock::new(None),
      limiter: RateLimiter {
        enabled: config.rate_limit.enabled,
        max_requests: config.rate_limit.max_requests,
        window: Duration::from_secs(config.rate_limit.window.max(1)),
        clients: Mutex::new(HashMap::new()),
      },
    };
    let control = AccessControl {
      shared: Arc::new(shared),
    };
    if config.enable_auth {
      control.set_auth(&config.username, &config.password);
    }
    if config.rate_limit.enabled {
      tracing::info!(
        "[access] rate limit enabled: {} requests / {}s",
        config.rate_limit.max_requests,
        config.rate_limit.window
      );
    }
    control
  }

  /// Enable Basic proxy authentication with the given credentials.
  pub fn set_auth(&self, username: &str, password: &str) {
    let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    *self.shared.auth.write().unwrap() = Some(AuthCredentials {
      username: username.to_string(),
      password_digest: digest,
    });
    tracing::info!("[access] proxy authentication enabled");
  }

  /// Admit an IP even when the whitelist is active.
  pub fn add_to_whitelist(&self, ip: impl Into<String>) {
    self.shared.whitelist.write().unwrap().insert(ip.into());
  }

  /// Reject an IP unconditionally.
  pub fn add_to_blacklist(&self, ip: impl Into<String>) {
    self.shared.blacklist.write().unwrap().insert(ip.into());
  }

  /// Resolve the effective client IP: first `X-Forwarded-For` entry, then
  /// `X-Real-IP`, then the peer address.
  pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
      if let Some(first) = xff.split(',').next() {
        let first = first.trim();
        if !first.is_empty() {
          return first.to_string();
        }
      }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
      let xri = xri.trim();
      if !xri.is_empty() {
        return xri.to_string();
      }
    }
    peer.ip().to_string()
  }

  /// Evaluate all gates for one request. The distinct error variants map to
  /// the client-visible status downstream.
  pub fn is_allowed(&self, headers: &HeaderMap, client_ip: &str) -> Result<()> {
    if self.shared.blacklist.read().unwrap().contains(client_ip) {
      return Err(Error::AccessDenied(format!("{} blacklisted", client_ip)));
    }
    {
      let whitelist = self.shared.whitelist.read().unwrap();
      if !whitelist.is_empty() && !whitelist.contains(client_ip) {
        return Err(Error::AccessDenied(format!("{} not whitelisted", client_ip)));
      }
    }
    self.check_auth(headers)?;
    self.shared.limiter.check(client_ip)?;
    Ok(())
  }

  fn check_auth(&self, headers: &HeaderMap) -> Result<()> {
    let auth = self.shared.auth.read().unwrap();
    let Some(credentials) = auth.as_ref() else {
      return Ok(());
    };
    let header = headers
      .get(http::header::PROXY_AUTHORIZATION)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::AuthFailed("missing proxy credentials".into()))?;
    let encoded = header
      .strip_prefix("Basic ")
      .ok_or_else(|| Error::AuthFailed("unsupported auth scheme".into()))?;
    let decoded = BASE64_STANDARD
      .decode(encoded.trim())
      .map_err(|_| Error::AuthFailed("malformed credentials".into()))?;
    let decoded =
      String::from_utf8(decoded).map_err(|_| Error::AuthFailed("malformed credentials".into()))?;
    let (username, password) = decoded
      .split_once(':')
      .ok_or_else(|| Error::AuthFailed("malformed credentials".into()))?;
    if username != credentials.username {
      return Err(Error::AuthFailed("unknown user".into()));
    }
    let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    if !constant_time_eq(&digest, &credentials.password_digest) {
      return Err(Error::AuthFailed("wrong password".into()));
    }
    Ok(())
  }

  /// Drop rate records idle for at least twice the window.
  pub fn evict_stale(&self) -> usize {
    self.shared.limiter.evict_stale()
  }

  /// Spawn a background task purging stale rate records every `interval`.
  ///
  /// The task ends when the controller is dropped.
  pub fn spawn_evictor(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
    let weak: Weak<AccessShared> = Arc::downgrade(&self.shared);
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        match weak.upgrade() {
          Some(shared) => {
            shared.limiter.evict_stale();
          }
          None => break,
        }
      }
    })
  }

  /// Summary counters for the monitor surface.
  pub fn stats(&self) -> AccessStats {
    AccessStats {
      whitelist_size: self.shared.whitelist.read().unwrap().len(),
      blacklist_size: self.shared.blacklist.read().unwrap().len(),
      auth_enabled: self.shared.auth.read().unwrap().is_some(),
      rate_limit_enabled: self.shared.limiter.enabled,
      tracked_clients: self.shared.limiter.clients.lock().unwrap().len(),
    }
  }
}

/// Summary counters of an [`AccessControl`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AccessStats {
  /// Whitelisted IPs
  pub whitelist_size: usize,
  /// Blacklisted IPs
  pub blacklist_size: usize,
  /// Whether Basic auth is required
  pub auth_enabled: bool,
  /// Whether the rate limit is enforced
  pub rate_limit_enabled: bool,
  /// Client IPs with live rate records
  pub tracked_clients: usize,
}

impl RateLimiter {
  fn check(&self, client_ip: &str) -> Result<()> {
    if !self.enabled {
      return Ok(());
    }
    let now = Instant::now();
    let mut clients = self.clients.lock().unwrap();
    let record = clients.entry(client_ip.to_string()).or_insert(ClientRecord {
      requests: Vec::new(),
      last_seen: now,
    });
    record
      .requests
      .retain(|t| now.duration_since(*t) < self.window);
    if record.requests.len() >= self.max_requests {
      return Err(Error::RateLimited(format!(
        "{}: {} requests / {:?}",
        client_ip, self.max_requests, self.window
      )));
    }
    record.requests.push(now);
    record.last_seen = now;
    Ok(())
  }

  fn evict_stale(&self) -> usize {
    let cutoff = self.window * 2;
    let mut clients = self.clients.lock().unwrap();
    let before = clients.len();
    clients.retain(|_, record| record.last_seen.elapsed() < cutoff);
    before - clients.len()
  }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  if a.len() != b.len() {
    return false;
  }
  a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RateLimitConfig;
  use http::HeaderValue;

  fn control(config: SecurityConfig) -> AccessControl {
    AccessControl::new(&config)
  }

  fn basic(user: &str, pass: &str) -> HeaderValue {
    let token = BASE64_STANDARD.encode(format!("{}:{}", user, pass));
    HeaderValue::from_str(&format!("Basic {}", token)).unwrap()
  }

  #[test]
  fn blacklist_wins_over_whitelist() {
    let ac = control(SecurityConfig {
      whitelist: vec!["10.0.0.1".into()],
      blacklist: vec!["10.0.0.1".into()],
      ..Default::default()
    });
    assert!(matches!(
      ac.is_allowed(&HeaderMap::new(), "10.0.0.1"),
      Err(Error::AccessDenied(_))
    ));
  }

  #[test]
  fn whitelist_excludes_others() {
    let ac = control(SecurityConfig {
      whitelist: vec!["10.0.0.1".into()],
      ..Default::default()
    });
    assert!(ac.is_allowed(&HeaderMap::new(), "10.0.0.1").is_ok());
    assert!(matches!(
      ac.is_allowed(&HeaderMap::new(), "10.0.0.2"),
      Err(Error::AccessDenied(_))
    ));
  }

  #[test]
  fn basic_auth_round_trip() {
    let ac = control(SecurityConfig {
      enable_auth: true,
      username: "admin".into(),
      password: "s3cret".into(),
      ..Default::default()
    });
    let mut headers = HeaderMap::new();
    assert!(matches!(
      ac.is_allowed(&headers, "10.0.0.1"),
      Err(Error::AuthFailed(_))
    ));
    headers.insert(http::header::PROXY_AUTHORIZATION, basic("admin", "s3cret"));
    assert!(ac.is_allowed(&headers, "10.0.0.1").is_ok());
    headers.insert(http::header::PROXY_AUTHORIZATION, basic("admin", "wrong"));
    assert!(matches!(
      ac.is_allowed(&headers, "10.0.0.1"),
      Err(Error::AuthFailed(_))
    ));
  }

  #[test]
  fn sliding_window_denies_over_limit() {
    let ac = control(SecurityConfig {
      rate_limit: RateLimitConfig {
        enabled: true,
        max_requests: 3,
        window: 1,
      },
      ..Default::default()
    });
    let headers = HeaderMap::new();
    for _ in 0..3 {
      assert!(ac.is_allowed(&headers, "10.0.0.1").is_ok());
    }
    assert!(matches!(
      ac.is_allowed(&headers, "10.0.0.1"),
      Err(Error::RateLimited(_))
    ));
    // Another client is unaffected.
    assert!(ac.is_allowed(&headers, "10.0.0.2").is_ok());
  }

  #[test]
  fn client_ip_precedence() {
    let peer: SocketAddr = "192.0.2.7:4444".parse().unwrap();
    let mut headers = HeaderMap::new();
    assert_eq!(AccessControl::client_ip(&headers, peer), "192.0.2.7");
    headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.9"));
    assert_eq!(AccessControl::client_ip(&headers, peer), "203.0.113.9");
    headers.insert(
      "x-forwarded-for",
      HeaderValue::from_static("198.51.100.2, 10.0.0.1"),
    );
    assert_eq!(AccessControl::client_ip(&headers, peer), "198.51.100.2");
  }

  #[test]
  fn evictor_drops_idle_records() {
    let ac = control(SecurityConfig {
      rate_limit: RateLimitConfig {
        enabled: true,
        max_requests: 10,
        window: 1,
      },
      ..Default::default()
    });
    ac.is_allowed(&HeaderMap::new(), "10.0.0.1").unwrap();
    assert_eq!(ac.stats().tracked_clients, 1);
    std::thread::sleep(Duration::from_millis(2100));
    assert_eq!(ac.evict_stale(), 1);
    assert_eq!(ac.stats().tracked_clients, 0);
  }
}
