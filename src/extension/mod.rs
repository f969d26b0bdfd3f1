//! Dynamically configured handler extensions
//!
//! The original design loaded shared objects at runtime; here modules are an
//! in-process registry of named factories satisfying the same lifecycle and
//! dispatch contract. A module exposes either a factory taking an options
//! map or a plain loader; the host resolves configured entries against the
//! registry, drives the lifecycle and dispatches role methods in priority
//! order.

mod framework;
mod host;

pub use framework::{FrameworkConfig, HookContext, HookExtension, HookFn, HookKind, MiddlewareFn};
pub use host::{ExtensionHost, ExtensionRecord, ExtensionStat, HostStats};

use crate::errors::Result;
use crate::pipeline::ExchangeContext;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Opaque options map handed to a module factory.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// The roles an extension can serve in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  /// Runs in the request chain
  Request,
  /// Runs in the response chain
  Response,
  /// Can veto requests before dispatch
  Filter,
  /// Observes requests, responses and errors
  Logger,
  /// Rewrites requests and responses
  Modifier,
  /// Produces analysis results, failures never abort the exchange
  Analytics,
}

/// Lifecycle states of a loaded extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionStatus {
  /// Constructed, not yet initialised
  Loaded,
  /// `initialize` succeeded
  Initialized,
  /// `start` succeeded; only started extensions are dispatched
  Started,
  /// `stop` succeeded
  Stopped,
  /// A lifecycle call failed
  Error,
  /// Removed from the registry
  Unloaded,
}

/// Inputs to a filter decision.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
  /// Effective client IP
  pub client_ip: String,
  /// User-Agent header
  pub user_agent: String,
  /// Requests seen on this connection so far
  pub request_count: u64,
  /// When the previous request arrived
  pub last_request: Option<SystemTime>,
  /// Free-form annotations
  pub metadata: HashMap<String, serde_json::Value>,
}

/// Inputs to error logging.
#[derive(Debug, Clone)]
pub struct ErrorContext {
  /// Error variant name
  pub error_type: String,
  /// Rendered error message
  pub message: String,
  /// When the error occurred
  pub timestamp: SystemTime,
}

/// Outcome of an analytics extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
  /// Whether the exchange looks hostile
  pub threat: bool,
  /// Severity label
  pub threat_level: String,
  /// Human-readable finding
  pub description: String,
  /// Analyser confidence in \[0, 1\]
  pub confidence: f64,
  /// Free-form detail
  #[serde(default)]
  pub metadata: HashMap<String, serde_json::Value>,
}

/// Identity and bookkeeping of a loaded extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
  /// Extension name
  pub name: String,
  /// Extension version
  pub version: String,
  /// What the extension does
  pub description: String,
  /// Roles the extension registered for
  pub roles: Vec<Role>,
  /// When the extension was loaded
  pub load_time: SystemTime,
}

/// A handler extension.
///
/// Role methods default to no-ops; an extension implements the subset its
/// declared [`roles`](Extension::roles) cover. Dispatch only ever reaches
/// extensions in the `Started` state.
#[async_trait]
pub trait Extension: Send + Sync {
  /// Unique name.
  fn name(&self) -> &str;

  /// Version string.
  fn version(&self) -> &str {
    "0.1.0"
  }

  /// Human-readable description.
  fn description(&self) -> &str {
    ""
  }

  /// Roles this extension serves in.
  fn roles(&self) -> Vec<Role>;

  /// Order within each role bucket, smaller runs first.
  fn priority(&self) -> i32 {
    100
  }

  /// Called once after construction with the configured options.
  async fn initialize(&self, _config: &ConfigMap) -> Result<()> {
    Ok(())
  }

  /// Called on start and after a stop.
  async fn start(&self) -> Result<()> {
    Ok(())
  }

  /// Called on stop, under the host's 30 second budget.
  async fn stop(&self) -> Result<()> {
    Ok(())
  }

  /// Called on unload, after which the record is forgotten.
  async fn cleanup(&self) -> Result<()> {
    Ok(())
  }

  /// Request-role hook.
  async fn process_request(
    &self,
    _request: &mut Request,
    _ctx: &mut ExchangeContext,
  ) -> Result<()> {
    Ok(())
  }

  /// Response-role hook.
  async fn process_response(
    &self,
    _response: &mut Response,
    _request: &Request,
    _ctx: &mut ExchangeContext,
  ) -> Result<()> {
    Ok(())
  }

  /// Filter-role hook; returning `false` denies the request.
  async fn should_allow(&self, _request: &Request, _ctx: &FilterContext) -> Result<bool> {
    Ok(true)
  }

  /// Modifier-role request hook, runs after the request chain.
  async fn modify_request(&self, _request: &mut Request, _ctx: &mut ExchangeContext) -> Result<()> {
    Ok(())
  }

  /// Modifier-role response hook, runs after the response chain.
  async fn modify_response(
    &self,
    _response: &mut Response,
    _request: &Request,
    _ctx: &mut ExchangeContext,
  ) -> Result<()> {
    Ok(())
  }

  /// Logger-role request hook, best effort.
  async fn log_request(&self, _request: &Request, _ctx: &ExchangeContext) -> Result<()> {
    Ok(())
  }

  /// Logger-role response hook, best effort.
  async fn log_response(
    &self,
    _response: &Response,
    _request: &Request,
    _ctx: &ExchangeContext,
  ) -> Result<()> {
    Ok(())
  }

  /// Logger-role error hook, best effort.
  async fn log_error(&self, _error: &ErrorContext) -> Result<()> {
    Ok(())
  }

  /// Analytics-role request hook; errors are counted, never fatal.
  async fn analyze_request(
    &self,
    _request: &Request,
    _ctx: &ExchangeContext,
  ) -> Result<Option<AnalysisResult>> {
    Ok(None)
  }

  /// Analytics-role response hook; errors are counted, never fatal.
  async fn analyze_response(
    &self,
    _response: &Response,
    _request: &Request,
    _ctx: &ExchangeContext,
  ) -> Result<Option<AnalysisResult>> {
    Ok(None)
  }
}

/// Factory signature: options map in, extension out.
pub type Factory = Arc<dyn Fn(&ConfigMap) -> Result<Arc<dyn Extension>> + Send + Sync>;
/// Loader signature for modules without options.
pub type Loader = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// A registered module the host can construct extensions from.
#[derive(Clone)]
pub struct ExtensionModule {
  /// Name configured entries resolve against
  pub name: String,
  /// Preferred constructor
  pub factory: Option<Factory>,
  /// Fallback constructor
  pub loader: Option<Loader>,
}

impl ExtensionModule {
  /// Module with a factory constructor.
  pub fn with_factory(
    name: impl Into<String>,
    factory: impl Fn(&ConfigMap) -> Result<Arc<dyn Extension>> + Send + Sync + 'static,
  ) -> Self {
    Self {
      name: name.into(),
      factory: Some(Arc::new(factory)),
      loader: None,
    }
  }

  /// Module with a plain loader constructor.
  pub fn with_loader(
    name: impl Into<String>,
    loader: impl Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
  ) -> Self {
    Self {
      name: name.into(),
      factory: None,
      loader: Some(Arc::new(loader)),
    }
  }
}
