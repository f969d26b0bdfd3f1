//! Proxy configuration document
//!
//! The recognised option tree mirrors the on-disk JSON document. Loading and
//! watching the file is left to the embedding binary; the engine only consumes
//! a fully constructed [`Config`].

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
  /// Listener configuration
  pub server: ServerConfig,
  /// Certificate authority configuration
  pub tls: TlsConfig,
  /// Relay behaviour
  pub proxy: ProxyConfig,
  /// Access control
  pub security: SecurityConfig,
  /// Metrics and health probes
  pub monitoring: MonitoringConfig,
  /// Extension modules
  pub plugins: ExtensionsConfig,
  /// Fingerprint engine
  pub fingerprint: FingerprintConfig,
  /// Logging
  pub logging: LoggingConfig,
  /// Performance tuning
  pub performance: PerformanceConfig,
}

/// Listener configuration. All timeouts are integer seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Bind address
  pub listen_addr: String,
  /// Bind port
  pub listen_port: u16,
  /// Per-request read deadline in seconds
  pub read_timeout: u64,
  /// Per-response write deadline in seconds
  pub write_timeout: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen_addr: "0.0.0.0".to_string(),
      listen_port: 8080,
      read_timeout: 30,
      write_timeout: 30,
    }
  }
}

/// Certificate authority configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
  /// Directory holding the root key and certificate
  pub cert_dir: PathBuf,
  /// Root key file, `<cert_dir>/ca-key.pem` when empty
  pub ca_key_file: PathBuf,
  /// Root certificate file, `<cert_dir>/ca-cert.pem` when empty
  pub ca_cert_file: PathBuf,
  /// Cache minted leaves per host
  pub enable_cert_cache: bool,
  /// Leaf cache TTL in seconds
  pub cert_cache_ttl: u64,
}

impl Default for TlsConfig {
  fn default() -> Self {
    Self {
      cert_dir: PathBuf::from("./certs"),
      ca_key_file: PathBuf::new(),
      ca_cert_file: PathBuf::new(),
      enable_cert_cache: true,
      cert_cache_ttl: 24 * 60 * 60,
    }
  }
}

/// Relay behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Accept plain HTTP requests
  pub enable_http: bool,
  /// Intercept CONNECT tunnels instead of blind-splicing them
  pub enable_https: bool,
  /// Splice WebSocket upgrades
  pub enable_websocket: bool,
  /// Total upstream budget per exchange in seconds
  pub upstream_timeout: u64,
  /// Upper bound of pooled idle origin connections
  pub max_idle_conns: usize,
  /// Gzip compressible response bodies
  pub enable_compression: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      enable_http: true,
      enable_https: true,
      enable_websocket: true,
      upstream_timeout: 30,
      max_idle_conns: 100,
      enable_compression: true,
    }
  }
}

/// Access control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
  /// Require `Proxy-Authorization: Basic`
  pub enable_auth: bool,
  /// Basic auth username
  pub username: String,
  /// Basic auth password
  pub password: String,
  /// When non-empty, only these client IPs are admitted
  pub whitelist: Vec<String>,
  /// Client IPs always rejected
  pub blacklist: Vec<String>,
  /// Sliding window rate limit
  pub rate_limit: RateLimitConfig,
}

/// Sliding window rate limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  /// Enforce the limit
  pub enabled: bool,
  /// Admitted requests per window per client IP
  pub max_requests: usize,
  /// Window length in seconds
  pub window: u64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      max_requests: 100,
      window: 60,
    }
  }
}

/// Metrics and health probe configuration. Serving the JSON endpoints is the
/// embedding binary's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
  /// Collect metrics
  pub enabled: bool,
  /// Port for the external monitor surface
  pub port: u16,
  /// Health probe ceilings
  pub health_checks: HealthChecksConfig,
}

impl Default for MonitoringConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      port: 9090,
      health_checks: HealthChecksConfig::default(),
    }
  }
}

/// Health probe ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthChecksConfig {
  /// Resident memory ceiling in MiB
  pub memory_limit_mb: u64,
  /// Live task ceiling
  #[serde(alias = "max_goroutines")]
  pub max_tasks: u64,
}

impl Default for HealthChecksConfig {
  fn default() -> Self {
    Self {
      memory_limit_mb: 512,
      max_tasks: 10000,
    }
  }
}

/// Extension host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
  /// Enable the extension host
  pub enabled: bool,
  /// Base directory configured extensions resolve relative paths against
  pub base_path: PathBuf,
  /// Load every configured entry at startup
  pub auto_load: bool,
  /// Configured extension entries
  pub plugins: Vec<ExtensionEntry>,
}

impl Default for ExtensionsConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      base_path: PathBuf::from("./plugins"),
      auto_load: true,
      plugins: Vec::new(),
    }
  }
}

/// One configured extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExtensionEntry {
  /// Registered module name
  pub name: String,
  /// Load this entry
  pub enabled: bool,
  /// Optional module path, kept for compatibility with on-disk layouts
  pub path: PathBuf,
  /// Priority inside each role bucket, smaller runs first
  pub priority: i32,
  /// Opaque options handed to the module factory
  pub config: serde_json::Map<String, serde_json::Value>,
}

/// Fingerprint engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
  /// Identify technologies on intercepted responses
  pub enabled: bool,
  /// Rule database path
  pub database: PathBuf,
  /// Result cache capacity
  pub cache_size: usize,
  /// Result cache TTL in seconds
  pub cache_ttl: u64,
  /// Early-exit bound on unique matches
  pub max_matches: usize,
}

impl Default for FingerprintConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      database: PathBuf::from("./fingerprint.json"),
      cache_size: 1000,
      cache_ttl: 30 * 60,
      max_matches: 10,
    }
  }
}

/// Logging configuration, consumed by the embedding binary when installing a
/// `tracing` subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Minimum level
  pub level: String,
  /// `stdout`, `stderr` or a file path
  pub output: String,
  /// `text` or `json`
  pub format: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      output: "stdout".to_string(),
      format: "text".to_string(),
    }
  }
}

/// Performance tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
  /// Scratch buffer size for body copies
  pub buffer_size: usize,
  /// Expose the profiler
  pub enable_pprof: bool,
  /// Profiler port
  pub pprof_port: u16,
}

impl Default for PerformanceConfig {
  fn default() -> Self {
    Self {
      buffer_size: 4096,
      enable_pprof: false,
      pprof_port: 6060,
    }
  }
}

impl Config {
  /// Parse a configuration document from JSON.
  pub fn from_json(data: &str) -> Result<Config> {
    let config: Config =
      serde_json::from_str(data).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Serialise the configuration to pretty JSON.
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
  }

  /// Reject configurations the engine cannot start with.
  pub fn validate(&self) -> Result<()> {
    if self.server.listen_port == 0 {
      return Err(Error::InvalidConfig("server.listen_port must be non-zero".into()));
    }
    if self.security.enable_auth && self.security.username.is_empty() {
      return Err(Error::InvalidConfig(
        "security.username required when auth is enabled".into(),
      ));
    }
    if self.security.rate_limit.enabled {
      if self.security.rate_limit.max_requests == 0 {
        return Err(Error::InvalidConfig(
          "security.rate_limit.max_requests must be non-zero".into(),
        ));
      }
      if self.security.rate_limit.window == 0 {
        return Err(Error::InvalidConfig(
          "security.rate_limit.window must be non-zero".into(),
        ));
      }
    }
    Ok(())
  }

  /// Listener bind address.
  pub fn listen_addr(&self) -> String {
    format!("{}:{}", self.server.listen_addr, self.server.listen_port)
  }

  /// Read deadline as a `Duration`.
  pub fn read_timeout(&self) -> Duration {
    Duration::from_secs(self.server.read_timeout)
  }

  /// Write deadline as a `Duration`.
  pub fn write_timeout(&self) -> Duration {
    Duration::from_secs(self.server.write_timeout)
  }

  /// Upstream budget as a `Duration`.
  pub fn upstream_timeout(&self) -> Duration {
    Duration::from_secs(self.proxy.upstream_timeout)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    assert_eq!(config.upstream_timeout(), Duration::from_secs(30));
  }

  #[test]
  fn json_round_trip_is_idempotent() {
    let config = Config::default();
    let first = config.to_json().unwrap();
    let parsed = Config::from_json(&first).unwrap();
    let second = parsed.to_json().unwrap();
    assert_eq!(config, parsed);
    assert_eq!(first, second);
  }

  #[test]
  fn rejects_auth_without_username() {
    let mut config = Config::default();
    config.security.enable_auth = true;
    assert!(matches!(config.validate(), Err(crate::Error::InvalidConfig(_))));
  }

  #[test]
  fn accepts_goroutine_alias() {
    let config = Config::from_json(
      r#"{"monitoring":{"enabled":true,"health_checks":{"max_goroutines":500}}}"#,
    )
    .unwrap();
    assert_eq!(config.monitoring.health_checks.max_tasks, 500);
  }
}
