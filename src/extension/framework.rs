//! Hook-based extension framework
//!
//! An extension built on [`HookExtension`] declares named hook lists instead
//! of implementing role methods directly. Middleware wraps every hook
//! right-to-left; synchronous hooks run on the blocking pool under a
//! timeout, asynchronous ones are spawned detached.

use super::{ErrorContext, Extension, FilterContext, Role};
use crate::errors::{Error, Result};
use crate::pipeline::ExchangeContext;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// The dispatch points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
  /// Start of request processing
  BeforeRequest,
  /// End of request processing
  AfterRequest,
  /// Start of response processing
  BeforeResponse,
  /// End of response processing
  AfterResponse,
  /// Filter decision
  OnFilter,
  /// Exchange failure
  OnError,
}

/// State shared with every hook of one dispatch.
#[derive(Default)]
pub struct HookContext {
  /// The request under processing, writable
  pub request: Mutex<Option<Request>>,
  /// The response under processing, writable
  pub response: Mutex<Option<Response>>,
  /// The error being reported, for `OnError` hooks
  pub error: Mutex<Option<String>>,
  /// Free-form hook-to-hook state; `allow` carries the filter verdict
  pub data: Mutex<HashMap<String, serde_json::Value>>,
}

impl HookContext {
  fn with_request(request: &Request) -> Arc<Self> {
    let ctx = HookContext::default();
    *ctx.request.lock().unwrap() = Some(request.clone());
    Arc::new(ctx)
  }
}

/// A hook body. Hooks observe and mutate through the shared context.
pub type HookFn = Arc<dyn Fn(&HookContext) -> Result<()> + Send + Sync>;
/// Wraps a hook into another hook; applied right-to-left.
pub type MiddlewareFn = Arc<dyn Fn(HookFn) -> HookFn + Send + Sync>;

/// Identity and execution policy of a [`HookExtension`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkConfig {
  /// Extension name
  pub name: String,
  /// Extension version
  #[serde(default)]
  pub version: String,
  /// What the extension does
  #[serde(default)]
  pub description: String,
  /// Priority inside role buckets
  #[serde(default)]
  pub priority: i32,
  /// Budget per synchronous hook in seconds, 30 when zero
  #[serde(default)]
  pub timeout: u64,
  /// Run hooks detached instead of inline
  #[serde(default, rename = "async")]
  pub asynchronous: bool,
}

impl FrameworkConfig {
  /// Minimal configuration with inline hooks.
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: "0.1.0".to_string(),
      description: String::new(),
      priority: 100,
      timeout: 30,
      asynchronous: false,
    }
  }

  fn budget(&self) -> Duration {
    if self.timeout == 0 {
      Duration::from_secs(30)
    } else {
      Duration::from_secs(self.timeout)
    }
  }
}

/// An extension whose behaviour is assembled from hook lists.
pub struct HookExtension {
  config: FrameworkConfig,
  hooks: RwLock<HashMap<HookKind, Vec<HookFn>>>,
  middleware: RwLock<Vec<MiddlewareFn>>,
}

impl HookExtension {
  /// Create an empty hook extension.
  pub fn new(config: FrameworkConfig) -> Self {
    Self {
      config,
      hooks: RwLock::new(HashMap::new()),
      middleware: RwLock::new(Vec::new()),
    }
  }

  /// Append a hook to `kind`.
  pub fn add_hook(&self, kind: HookKind, hook: impl Fn(&HookContext) -> Result<()> + Send + Sync + 'static) {
    self
      .hooks
      .write()
      .unwrap()
      .entry(kind)
      .or_default()
      .push(Arc::new(hook));
  }

  /// Append a middleware layer.
  pub fn add_middleware(&self, middleware: impl Fn(HookFn) -> HookFn + Send + Sync + 'static) {
    self.middleware.write().unwrap().push(Arc::new(middleware));
  }

  /// Drop every hook.
  pub fn clear_hooks(&self) {
    self.hooks.write().unwrap().clear();
  }

  /// Hook counts per kind.
  pub fn hook_counts(&self) -> HashMap<HookKind, usize> {
    self
      .hooks
      .read()
      .unwrap()
      .iter()
      .map(|(kind, hooks)| (*kind, hooks.len()))
      .collect()
  }

  async fn run_hooks(&self, kind: HookKind, ctx: Arc<HookContext>) -> Result<()> {
    let hooks = self
      .hooks
      .read()
      .unwrap()
      .get(&kind)
      .cloned()
      .unwrap_or_default();
    if hooks.is_empty() {
      return Ok(());
    }
    let middleware = self.middleware.read().unwrap().clone();
    for hook in hooks {
      let mut wrapped = hook;
      for layer in middleware.iter().rev() {
        wrapped = layer(wrapped);
      }
      if self.config.asynchronous {
        let ctx = Arc::clone(&ctx);
        let name = self.config.name.clone();
        tokio::task::spawn_blocking(move || {
          match std::panic::catch_unwind(AssertUnwindSafe(|| wrapped(&ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("[extension] {} async hook failed: {}", name, e),
            Err(_) => tracing::error!("[extension] {} async hook panicked", name),
          }
        });
      } else {
        self.run_with_budget(wrapped, Arc::clone(&ctx)).await?;
      }
    }
    Ok(())
  }

  async fn run_with_budget(&self, hook: HookFn, ctx: Arc<HookContext>) -> Result<()> {
    let handle = tokio::task::spawn_blocking(move || {
      std::panic::catch_unwind(AssertUnwindSafe(|| hook(&ctx)))
    });
    match tokio::time::timeout(self.config.budget(), handle).await {
      Err(_) => Err(Error::HookTimeout(self.config.name.clone())),
      Ok(Err(join)) => Err(Error::HandlerCrash(format!(
        "{}: {}",
        self.config.name, join
      ))),
      Ok(Ok(Err(_panic))) => Err(Error::HandlerCrash(self.config.name.clone())),
      Ok(Ok(Ok(result))) => result,
    }
  }

  /// Run `OnError` hooks for a failed exchange.
  pub async fn dispatch_error(&self, error: &Error) -> Result<()> {
    let ctx = Arc::new(HookContext::default());
    *ctx.error.lock().unwrap() = Some(error.to_string());
    self.run_hooks(HookKind::OnError, ctx).await
  }
}

#[async_trait]
impl Extension for HookExtension {
  fn name(&self) -> &str {
    &self.config.name
  }

  fn version(&self) -> &str {
    &self.config.version
  }

  fn description(&self) -> &str {
    &self.config.description
  }

  fn roles(&self) -> Vec<Role> {
    vec![Role::Request, Role::Response, Role::Filter, Role::Logger]
  }

  fn priority(&self) -> i32 {
    self.config.priority
  }

  async fn process_request(
    &self,
    request: &mut Request,
    _ctx: &mut ExchangeContext,
  ) -> Result<()> {
    let ctx = HookContext::with_request(request);
    self.run_hooks(HookKind::BeforeRequest, Arc::clone(&ctx)).await?;
    self.run_hooks(HookKind::AfterRequest, Arc::clone(&ctx)).await?;
    if let Some(rewritten) = ctx.request.lock().unwrap().take() {
      *request = rewritten;
    }
    Ok(())
  }

  async fn process_response(
    &self,
    response: &mut Response,
    request: &Request,
    _ctx: &mut ExchangeContext,
  ) -> Result<()> {
    let ctx = HookContext::with_request(request);
    *ctx.response.lock().unwrap() = Some(response.clone());
    self.run_hooks(HookKind::BeforeResponse, Arc::clone(&ctx)).await?;
    self.run_hooks(HookKind::AfterResponse, Arc::clone(&ctx)).await?;
    if let Some(rewritten) = ctx.response.lock().unwrap().take() {
      *response = rewritten;
    }
    Ok(())
  }

  async fn should_allow(&self, request: &Request, _ctx: &FilterContext) -> Result<bool> {
    let ctx = HookContext::with_request(request);
    ctx
      .data
      .lock()
      .unwrap()
      .insert("allow".to_string(), serde_json::Value::Bool(true));
    self.run_hooks(HookKind::OnFilter, Arc::clone(&ctx)).await?;
    let allowed = ctx
      .data
      .lock()
      .unwrap()
      .get("allow")
      .and_then(|v| v.as_bool())
      .unwrap_or(true);
    Ok(allowed)
  }

  async fn log_error(&self, error: &ErrorContext) -> Result<()> {
    let ctx = Arc::new(HookContext::default());
    *ctx.error.lock().unwrap() = Some(error.message.clone());
    self.run_hooks(HookKind::OnError, ctx).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn request() -> Request {
    http::Request::builder()
      .uri("http://example.com/hooked")
      .body(Bytes::new())
      .unwrap()
      .into()
  }

  #[tokio::test]
  async fn hooks_mutate_the_request() {
    let ext = HookExtension::new(FrameworkConfig::named("rewriter"));
    ext.add_hook(HookKind::BeforeRequest, |ctx| {
      if let Some(request) = ctx.request.lock().unwrap().as_mut() {
        request
          .headers_mut()
          .insert("x-hooked", http::HeaderValue::from_static("1"));
      }
      Ok(())
    });
    let mut req = request();
    let mut exchange = ExchangeContext::new(&req, "10.0.0.1");
    ext.process_request(&mut req, &mut exchange).await.unwrap();
    assert_eq!(req.headers().get("x-hooked").unwrap(), "1");
  }

  #[tokio::test]
  async fn middleware_applies_right_to_left() {
    let ext = HookExtension::new(FrameworkConfig::named("layered"));
    let order = Arc::new(Mutex::new(Vec::new()));
    let o1 = Arc::clone(&order);
    ext.add_middleware(move |next: HookFn| {
      let o = Arc::clone(&o1);
      Arc::new(move |ctx: &HookContext| {
        o.lock().unwrap().push("outer");
        next(ctx)
      })
    });
    let o2 = Arc::clone(&order);
    ext.add_middleware(move |next: HookFn| {
      let o = Arc::clone(&o2);
      Arc::new(move |ctx: &HookContext| {
        o.lock().unwrap().push("inner");
        next(ctx)
      })
    });
    let o3 = Arc::clone(&order);
    ext.add_hook(HookKind::BeforeRequest, move |_| {
      o3.lock().unwrap().push("hook");
      Ok(())
    });
    let mut req = request();
    let mut exchange = ExchangeContext::new(&req, "10.0.0.1");
    ext.process_request(&mut req, &mut exchange).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "hook"]);
  }

  #[tokio::test]
  async fn filter_hook_denies_via_allow_flag() {
    let ext = HookExtension::new(FrameworkConfig::named("filter"));
    ext.add_hook(HookKind::OnFilter, |ctx| {
      let blocked = ctx
        .request
        .lock()
        .unwrap()
        .as_ref()
        .map(|r| r.uri().path().starts_with("/hooked"))
        .unwrap_or(false);
      if blocked {
        ctx
          .data
          .lock()
          .unwrap()
          .insert("allow".to_string(), serde_json::Value::Bool(false));
      }
      Ok(())
    });
    let allowed = ext
      .should_allow(&request(), &FilterContext::default())
      .await
      .unwrap();
    assert!(!allowed);
  }

  #[tokio::test]
  async fn slow_sync_hook_times_out() {
    let mut config = FrameworkConfig::named("slow");
    config.timeout = 1;
    let ext = HookExtension::new(config);
    ext.add_hook(HookKind::BeforeRequest, |_| {
      std::thread::sleep(Duration::from_secs(5));
      Ok(())
    });
    let mut req = request();
    let mut exchange = ExchangeContext::new(&req, "10.0.0.1");
    let err = ext
      .process_request(&mut req, &mut exchange)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::HookTimeout(_)));
  }

  #[tokio::test]
  async fn panicking_hook_is_a_crash() {
    let ext = HookExtension::new(FrameworkConfig::named("bomb"));
    ext.add_hook(HookKind::BeforeRequest, |_| panic!("hook bomb"));
    let mut req = request();
    let mut exchange = ExchangeContext::new(&req, "10.0.0.1");
    let err = ext
      .process_request(&mut req, &mut exchange)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::HandlerCrash(_)));
  }
}
