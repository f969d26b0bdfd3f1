//! Extension registry, lifecycle and dispatch

use super::{
  AnalysisResult, ErrorContext, Extension, ExtensionInfo, ExtensionModule, ExtensionStatus,
  FilterContext, Role,
};
use crate::config::{ExtensionEntry, ExtensionsConfig};
use crate::errors::{Error, Result};
use crate::pipeline::ExchangeContext;
use crate::request::Request;
use crate::response::Response;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

const STOP_BUDGET: Duration = Duration::from_secs(30);

const ALL_ROLES: [Role; 6] = [
  Role::Request,
  Role::Response,
  Role::Filter,
  Role::Logger,
  Role::Modifier,
  Role::Analytics,
];

/// Bookkeeping for one loaded extension.
pub struct ExtensionRecord {
  /// The extension itself
  pub extension: Arc<dyn Extension>,
  /// Identity captured at load time
  pub info: ExtensionInfo,
  /// The entry this extension was loaded from
  pub entry: ExtensionEntry,
  status: StdRwLock<ExtensionStatus>,
  /// Role-method invocations
  pub call_count: AtomicU64,
  /// Role-method failures; never exceeds `call_count`
  pub error_count: AtomicU64,
  insertion: u64,
}

impl ExtensionRecord {
  /// Current lifecycle state.
  pub fn status(&self) -> ExtensionStatus {
    *self.status.read().unwrap()
  }

  fn set_status(&self, status: ExtensionStatus) {
    *self.status.write().unwrap() = status;
  }

  /// Effective priority: the configured entry wins over the extension's
  /// default.
  pub fn priority(&self) -> i32 {
    if self.entry.priority != 0 {
      self.entry.priority
    } else {
      self.extension.priority()
    }
  }
}

/// Per-extension counter snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostStats {
  /// Loaded extensions
  pub total: usize,
  /// Extensions per role bucket
  pub by_role: HashMap<Role, usize>,
  /// Per-extension status and counters
  pub extensions: Vec<ExtensionStat>,
}

/// One extension's counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtensionStat {
  /// Extension name
  pub name: String,
  /// Lifecycle state
  pub status: ExtensionStatus,
  /// Role-method invocations
  pub call_count: u64,
  /// Role-method failures
  pub error_count: u64,
}

/// The in-process module registry and dispatcher.
#[derive(Default)]
pub struct ExtensionHost {
  modules: StdRwLock<HashMap<String, ExtensionModule>>,
  records: RwLock<HashMap<String, Arc<ExtensionRecord>>>,
  buckets: RwLock<HashMap<Role, Vec<Arc<ExtensionRecord>>>>,
  insertions: AtomicU64,
}

impl ExtensionHost {
  /// Create an empty host.
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a module configured entries can resolve against.
  pub fn register_module(&self, module: ExtensionModule) {
    self
      .modules
      .write()
      .unwrap()
      .insert(module.name.clone(), module);
  }

  /// Load, initialise and start the extension named by `entry`.
  pub async fn load(&self, entry: &ExtensionEntry) -> Result<()> {
    if !entry.enabled {
      tracing::debug!("[extension] {} disabled, skipping", entry.name);
      return Ok(());
    }
    {
      let records = self.records.read().await;
      if let Some(existing) = records.get(&entry.name) {
        if existing.status() != ExtensionStatus::Error {
          return Err(Error::HandlerLoadFailed(format!(
            "{} already loaded",
            entry.name
          )));
        }
      }
    }
    // A previous failed load keeps its record until replaced.
    let _ = self.unload(&entry.name).await;

    let module = self
      .modules
      .read()
      .unwrap()
      .get(&entry.name)
      .cloned()
      .ok_or_else(|| {
        Error::HandlerLoadFailed(format!("no module registered as {}", entry.name))
      })?;
    let extension: Arc<dyn Extension> = if let Some(factory) = &module.factory {
      factory(&entry.config)?
    } else if let Some(loader) = &module.loader {
      loader()
    } else {
      return Err(Error::HandlerLoadFailed(format!(
        "module {} exposes neither factory nor loader",
        module.name
      )));
    };

    let record = Arc::new(ExtensionRecord {
      info: ExtensionInfo {
        name: extension.name().to_string(),
        version: extension.version().to_string(),
        description: extension.description().to_string(),
        roles: extension.roles(),
        load_time: SystemTime::now(),
      },
      entry: entry.clone(),
      status: StdRwLock::new(ExtensionStatus::Loaded),
      call_count: AtomicU64::new(0),
      error_count: AtomicU64::new(0),
      insertion: self.insertions.fetch_add(1, Ordering::Relaxed),
      extension,
    });

    if let Err(e) = record.extension.initialize(&entry.config).await {
      record.set_status(ExtensionStatus::Error);
      self
        .records
        .write()
        .await
        .insert(entry.name.clone(), record);
      return Err(e);
    }
    record.set_status(ExtensionStatus::Initialized);

    self
      .records
      .write()
      .await
      .insert(entry.name.clone(), Arc::clone(&record));
    self.insert_into_buckets(&record).await;
    self.start(&entry.name).await?;
    tracing::info!(
      "[extension] loaded {} v{} ({:?})",
      record.info.name,
      record.info.version,
      record.info.roles
    );
    Ok(())
  }

  async fn insert_into_buckets(&self, record: &Arc<ExtensionRecord>) {
    let mut buckets = self.buckets.write().await;
    for role in record.info.roles.iter() {
      let bucket = buckets.entry(*role).or_default();
      bucket.push(Arc::clone(record));
      bucket.sort_by_key(|r| (r.priority(), r.insertion));
    }
  }

  async fn remove_from_buckets(&self, name: &str) {
    let mut buckets = self.buckets.write().await;
    for bucket in buckets.values_mut() {
      bucket.retain(|r| r.info.name != name && r.entry.name != name);
    }
  }

  /// Start a stopped or freshly initialised extension.
  pub async fn start(&self, name: &str) -> Result<()> {
    let record = self.record(name).await?;
    match record.status() {
      ExtensionStatus::Initialized | ExtensionStatus::Stopped => {}
      other => {
        return Err(Error::HandlerLoadFailed(format!(
          "{} cannot start from state {:?}",
          name, other
        )));
      }
    }
    if let Err(e) = record.extension.start().await {
      record.set_status(ExtensionStatus::Error);
      return Err(e);
    }
    record.set_status(ExtensionStatus::Started);
    Ok(())
  }

  /// Stop a started extension, under the stop budget.
  pub async fn stop(&self, name: &str) -> Result<()> {
    let record = self.record(name).await?;
    if record.status() != ExtensionStatus::Started {
      return Err(Error::HandlerLoadFailed(format!(
        "{} cannot stop from state {:?}",
        name,
        record.status()
      )));
    }
    match tokio::time::timeout(STOP_BUDGET, record.extension.stop()).await {
      Ok(Ok(())) => {
        record.set_status(ExtensionStatus::Stopped);
        Ok(())
      }
      Ok(Err(e)) => {
        record.set_status(ExtensionStatus::Error);
        Err(e)
      }
      Err(_) => {
        record.set_status(ExtensionStatus::Error);
        Err(Error::HookTimeout(format!("{} stop", name)))
      }
    }
  }

  /// Stop, clean up and forget an extension.
  pub async fn unload(&self, name: &str) -> Result<()> {
    let record = match self.records.write().await.remove(name) {
      Some(record) => record,
      None => {
        return Err(Error::HandlerLoadFailed(format!("{} not loaded", name)));
      }
    };
    self.remove_from_buckets(name).await;
    if record.status() == ExtensionStatus::Started {
      let _ = tokio::time::timeout(STOP_BUDGET, record.extension.stop()).await;
    }
    if let Err(e) = record.extension.cleanup().await {
      tracing::error!("[extension] {} cleanup failed: {}", name, e);
    }
    record.set_status(ExtensionStatus::Unloaded);
    tracing::info!("[extension] unloaded {}", name);
    Ok(())
  }

  /// Stop → unload → load with the entry recorded at load time.
  pub async fn reload(&self, name: &str) -> Result<()> {
    let entry = self.record(name).await?.entry.clone();
    if self.record(name).await?.status() == ExtensionStatus::Started {
      self.stop(name).await?;
    }
    self.unload(name).await?;
    self.load(&entry).await
  }

  /// Load every enabled entry of `config` when auto-load is on.
  pub async fn load_all(&self, config: &ExtensionsConfig) -> Result<()> {
    if !config.enabled || !config.auto_load {
      return Ok(());
    }
    for entry in &config.plugins {
      if let Err(e) = self.load(entry).await {
        tracing::error!("[extension] failed to load {}: {}", entry.name, e);
      }
    }
    Ok(())
  }

  /// Stop and unload everything.
  pub async fn shutdown(&self) {
    let names: Vec<String> = self.records.read().await.keys().cloned().collect();
    for name in names {
      let _ = self.unload(&name).await;
    }
  }

  async fn record(&self, name: &str) -> Result<Arc<ExtensionRecord>> {
    self
      .records
      .read()
      .await
      .get(name)
      .cloned()
      .ok_or_else(|| Error::HandlerLoadFailed(format!("{} not loaded", name)))
  }

  async fn bucket(&self, role: Role) -> Vec<Arc<ExtensionRecord>> {
    self
      .buckets
      .read()
      .await
      .get(&role)
      .cloned()
      .unwrap_or_default()
  }

  /// Dispatch a role method with panic isolation and counter upkeep.
  async fn dispatch<T, F>(&self, record: &ExtensionRecord, fut: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    record.call_count.fetch_add(1, Ordering::Relaxed);
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => {
        record.error_count.fetch_add(1, Ordering::Relaxed);
        Err(e)
      }
      Err(_panic) => {
        record.error_count.fetch_add(1, Ordering::Relaxed);
        Err(Error::HandlerCrash(record.info.name.clone()))
      }
    }
  }

  /// Walk the request and modifier buckets. The first error aborts.
  pub async fn process_request(
    &self,
    request: &mut Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()> {
    for record in self.bucket(Role::Request).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      self
        .dispatch(&record, record.extension.process_request(request, ctx))
        .await
        .inspect_err(|e| {
          tracing::error!("[extension] {} request failed: {}", record.info.name, e)
        })?;
    }
    for record in self.bucket(Role::Modifier).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      self
        .dispatch(&record, record.extension.modify_request(request, ctx))
        .await?;
    }
    Ok(())
  }

  /// Walk the response and modifier buckets. The first error aborts.
  pub async fn process_response(
    &self,
    response: &mut Response,
    request: &Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()> {
    for record in self.bucket(Role::Response).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      self
        .dispatch(&record, record.extension.process_response(response, request, ctx))
        .await
        .inspect_err(|e| {
          tracing::error!("[extension] {} response failed: {}", record.info.name, e)
        })?;
    }
    for record in self.bucket(Role::Modifier).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      self
        .dispatch(&record, record.extension.modify_response(response, request, ctx))
        .await?;
    }
    Ok(())
  }

  /// Walk the filter bucket. The first deny ends the scan; errors surface.
  pub async fn should_allow(&self, request: &Request, ctx: &FilterContext) -> Result<bool> {
    for record in self.bucket(Role::Filter).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      let allowed = self
        .dispatch(&record, record.extension.should_allow(request, ctx))
        .await?;
      if !allowed {
        tracing::debug!("[extension] {} denied {}", record.info.name, request.uri());
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Walk the logger bucket, best effort: failures are counted, not raised.
  pub async fn log_request(&self, request: &Request, ctx: &ExchangeContext) {
    for record in self.bucket(Role::Logger).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      let _ = self
        .dispatch(&record, record.extension.log_request(request, ctx))
        .await;
    }
  }

  /// Walk the logger bucket for a response, best effort.
  pub async fn log_response(&self, response: &Response, request: &Request, ctx: &ExchangeContext) {
    for record in self.bucket(Role::Logger).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      let _ = self
        .dispatch(
          &record,
          record.extension.log_response(response, request, ctx),
        )
        .await;
    }
  }

  /// Walk the logger bucket for an error, best effort.
  pub async fn log_error(&self, error: &Error) {
    let ctx = ErrorContext {
      error_type: format!("{:?}", std::mem::discriminant(error)),
      message: error.to_string(),
      timestamp: SystemTime::now(),
    };
    for record in self.bucket(Role::Logger).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      let _ = self
        .dispatch(&record, record.extension.log_error(&ctx))
        .await;
    }
  }

  /// Walk the analytics bucket; failures are counted, never fatal.
  pub async fn analyze_response(
    &self,
    response: &Response,
    request: &Request,
    ctx: &ExchangeContext,
  ) -> Vec<AnalysisResult> {
    let mut results = Vec::new();
    for record in self.bucket(Role::Analytics).await {
      if record.status() != ExtensionStatus::Started {
        continue;
      }
      match self
        .dispatch(
          &record,
          record.extension.analyze_response(response, request, ctx),
        )
        .await
      {
        Ok(Some(result)) => results.push(result),
        Ok(None) => {}
        Err(e) => {
          tracing::warn!("[extension] {} analysis failed: {}", record.info.name, e);
        }
      }
    }
    results
  }

  /// Identity and status of every loaded extension.
  pub async fn list(&self) -> Vec<(ExtensionInfo, ExtensionStatus)> {
    self
      .records
      .read()
      .await
      .values()
      .map(|r| (r.info.clone(), r.status()))
      .collect()
  }

  /// Counter snapshot across the registry.
  pub async fn stats(&self) -> HostStats {
    let records = self.records.read().await;
    let buckets = self.buckets.read().await;
    HostStats {
      total: records.len(),
      by_role: ALL_ROLES
        .iter()
        .map(|role| (*role, buckets.get(role).map(Vec::len).unwrap_or(0)))
        .collect(),
      extensions: records
        .values()
        .map(|r| ExtensionStat {
          name: r.info.name.clone(),
          status: r.status(),
          call_count: r.call_count.load(Ordering::Relaxed),
          error_count: r.error_count.load(Ordering::Relaxed),
        })
        .collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  struct OrderProbe {
    name: String,
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
  }

  #[async_trait::async_trait]
  impl Extension for OrderProbe {
    fn name(&self) -> &str {
      &self.name
    }
    fn roles(&self) -> Vec<Role> {
      vec![Role::Request]
    }
    fn priority(&self) -> i32 {
      self.priority
    }
    async fn process_request(
      &self,
      _request: &mut Request,
      _ctx: &mut ExchangeContext,
    ) -> Result<()> {
      self.log.lock().unwrap().push(self.name.clone());
      Ok(())
    }
  }

  fn entry(name: &str) -> ExtensionEntry {
    ExtensionEntry {
      name: name.to_string(),
      enabled: true,
      ..Default::default()
    }
  }

  fn probe_module(name: &'static str, priority: i32, log: Arc<Mutex<Vec<String>>>) -> ExtensionModule {
    ExtensionModule::with_loader(name, move || {
      Arc::new(OrderProbe {
        name: name.to_string(),
        priority,
        log: Arc::clone(&log),
      })
    })
  }

  #[tokio::test]
  async fn priority_then_insertion_order() {
    let host = ExtensionHost::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    host.register_module(probe_module("h1", 10, Arc::clone(&log)));
    host.register_module(probe_module("h2", 5, Arc::clone(&log)));
    host.register_module(probe_module("h3", 5, Arc::clone(&log)));
    for name in ["h1", "h2", "h3"] {
      host.load(&entry(name)).await.unwrap();
    }
    let mut request: Request = http::Request::builder()
      .uri("http://example.com/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    host.process_request(&mut request, &mut ctx).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["h2", "h3", "h1"]);
  }

  #[tokio::test]
  async fn missing_module_is_load_failed() {
    let host = ExtensionHost::new();
    let err = host.load(&entry("ghost")).await.unwrap_err();
    assert!(matches!(err, Error::HandlerLoadFailed(_)));
  }

  #[tokio::test]
  async fn module_without_constructors_is_load_failed() {
    let host = ExtensionHost::new();
    host.register_module(ExtensionModule {
      name: "hollow".to_string(),
      factory: None,
      loader: None,
    });
    let err = host.load(&entry("hollow")).await.unwrap_err();
    assert!(matches!(err, Error::HandlerLoadFailed(_)));
  }

  #[tokio::test]
  async fn panicking_extension_is_isolated() {
    struct Bomb;
    #[async_trait::async_trait]
    impl Extension for Bomb {
      fn name(&self) -> &str {
        "bomb"
      }
      fn roles(&self) -> Vec<Role> {
        vec![Role::Request]
      }
      async fn process_request(
        &self,
        _request: &mut Request,
        _ctx: &mut ExchangeContext,
      ) -> Result<()> {
        panic!("boom");
      }
    }
    let host = ExtensionHost::new();
    host.register_module(ExtensionModule::with_loader("bomb", || Arc::new(Bomb)));
    host.load(&entry("bomb")).await.unwrap();
    let mut request: Request = http::Request::builder()
      .uri("http://example.com/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    let err = host
      .process_request(&mut request, &mut ctx)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::HandlerCrash(_)));
    let stats = host.stats().await;
    let bomb = stats.extensions.iter().find(|e| e.name == "bomb").unwrap();
    assert_eq!(bomb.call_count, 1);
    assert_eq!(bomb.error_count, 1);
  }

  #[tokio::test]
  async fn lifecycle_stop_start_reload() {
    let host = ExtensionHost::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    host.register_module(probe_module("cycle", 1, Arc::clone(&log)));
    host.load(&entry("cycle")).await.unwrap();
    assert_eq!(
      host.record("cycle").await.unwrap().status(),
      ExtensionStatus::Started
    );
    host.stop("cycle").await.unwrap();
    assert_eq!(
      host.record("cycle").await.unwrap().status(),
      ExtensionStatus::Stopped
    );
    // Stopped extensions are skipped by dispatch.
    let mut request: Request = http::Request::builder()
      .uri("http://example.com/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    host.process_request(&mut request, &mut ctx).await.unwrap();
    assert!(log.lock().unwrap().is_empty());
    host.start("cycle").await.unwrap();
    host.reload("cycle").await.unwrap();
    assert_eq!(
      host.record("cycle").await.unwrap().status(),
      ExtensionStatus::Started
    );
  }
}
