#![deny(missing_docs)]

//! # snare
//!
//! An intercepting HTTP/HTTPS/WebSocket proxy engine. TLS is terminated
//! against clients with leaf certificates minted on the fly and signed by a
//! local root CA; every request/response pair runs through ordered handler
//! chains and an extension host before being relayed to the real origin.
//! Intercepted responses can additionally be classified by traffic pattern
//! and fingerprinted for the server technologies behind them.
//!
//! # Features
//!
//! - Automatic root CA generation with per-host leaf caching
//! - CONNECT interception with rustls, WebSocket splicing, HTTP/1.1 relay
//! - IP allow/deny lists, Basic proxy auth, sliding-window rate limiting
//! - Request/response pipelines plus a lifecycle-managed extension host
//! - Layered-index CMS/technology fingerprinting of responses
//!
//! # Example
//!
//! ```no_run
//! use snare::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let mut config = Config::default();
//!   config.server.listen_port = 8080;
//!   let proxy = ProxyServer::from_config(config).await?;
//!   println!("trust this CA:\n{}", proxy.ca_cert_pem());
//!   proxy.run().await?;
//!   Ok(())
//! }
//! ```

mod access;
mod arena;
mod body;
mod ca;
mod cache;
mod client;
mod config;
mod errors;
/// Extension host: modules, lifecycle, hooks
pub mod extension;
/// Technology fingerprinting
pub mod fingerprint;
mod metrics;
/// Traffic pattern recognition
pub mod pattern;
/// Handler chains and the exchange context
pub mod pipeline;
mod request;
mod response;
mod server;

pub use access::{AccessControl, AccessStats};
pub use arena::{ArenaBuf, ArenaStats, BufferArena};
pub use body::Body;
pub use ca::{CertManager, CertOptions, CertificateAuthority, LeafCert};
pub use cache::{CacheStats, TtlCache};
pub use client::{Client, ClientBuilder};
pub use config::{
  Config, ExtensionEntry, ExtensionsConfig, FingerprintConfig, ProxyConfig, RateLimitConfig,
  SecurityConfig, ServerConfig, TlsConfig,
};
pub use errors::{Error, Result};
pub use fingerprint::{FingerprintEngine, FingerprintOptions, FingerprintResult, HttpSample};
pub use http::{Method, StatusCode, Uri, Version};
pub use metrics::{
  ArenaHitRateCheck, CeilingCheck, HealthCheck, HealthRegistry, HealthStatus, Metrics,
  MetricsSnapshot,
};
pub use request::Request;
pub use response::Response;
pub use server::{ProxyServer, ProxyServerBuilder};

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const SPACE: &[u8] = b" ";
pub(crate) const COLON_SPACE: &[u8] = b": ";
