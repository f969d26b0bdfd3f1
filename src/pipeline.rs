//! Ordered request and response handler chains
//!
//! Handlers run in registration order; the first error aborts the chain and
//! fails the exchange. Extension-hosted handlers run after these built-in
//! chains.

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Per-request mutable state carried through the whole pipeline. Created on
/// arrival, dropped once the response has been forwarded.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
  /// When the request was decoded
  pub start_time: Instant,
  /// Effective client IP
  pub client_ip: String,
  /// Request method
  pub method: Method,
  /// Absolute request URL
  pub url: String,
  /// Request headers as they arrived, before stripping
  pub headers_snapshot: HeaderMap,
  /// Request body size in bytes
  pub body_bytes: u64,
  /// Free-form handler annotations
  pub metadata: HashMap<String, serde_json::Value>,
  /// Status sent to the client, once known
  pub response_status: Option<StatusCode>,
  /// Response headers after processing, once known
  pub response_headers: Option<HeaderMap>,
  /// Response body size in bytes
  pub response_size: u64,
  /// Total exchange duration, once finished
  pub duration: Option<Duration>,
}

impl ExchangeContext {
  /// Snapshot the request into a fresh context.
  pub fn new(request: &Request, client_ip: impl Into<String>) -> Self {
    Self {
      start_time: Instant::now(),
      client_ip: client_ip.into(),
      method: request.method().clone(),
      url: request.uri().to_string(),
      headers_snapshot: request.headers().clone(),
      body_bytes: request.body().map(|b| b.len() as u64).unwrap_or(0),
      metadata: HashMap::new(),
      response_status: None,
      response_headers: None,
      response_size: 0,
      duration: None,
    }
  }

  /// Record the processed response into the context.
  pub fn record_response(&mut self, response: &Response) {
    self.response_status = Some(response.status_code());
    self.response_headers = Some(response.headers().clone());
    self.response_size = response.body().map(|b| b.len() as u64).unwrap_or(0);
    self.duration = Some(self.start_time.elapsed());
  }
}

/// A step of the request chain.
#[async_trait]
pub trait RequestHandler: Send + Sync {
  /// Inspect or rewrite the outbound request.
  async fn handle_request(&self, request: &mut Request, ctx: &mut ExchangeContext) -> Result<()>;
}

/// A step of the response chain.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
  /// Inspect or rewrite the inbound response.
  async fn handle_response(
    &self,
    response: &mut Response,
    request: &Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()>;
}

/// Options for [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
  /// Largest request or response body accepted
  pub max_body_size: u64,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      max_body_size: 10 * 1024 * 1024,
    }
  }
}

/// The ordered handler chains.
pub struct Pipeline {
  request_handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
  response_handlers: RwLock<Vec<Arc<dyn ResponseHandler>>>,
  max_body_size: u64,
}

impl Pipeline {
  /// Create an empty pipeline.
  pub fn new(options: PipelineOptions) -> Self {
    Self {
      request_handlers: RwLock::new(Vec::new()),
      response_handlers: RwLock::new(Vec::new()),
      max_body_size: options.max_body_size,
    }
  }

  /// Append a request handler.
  pub fn add_request_handler(&self, handler: Arc<dyn RequestHandler>) {
    self.request_handlers.write().unwrap().push(handler);
  }

  /// Append a response handler.
  pub fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
    self.response_handlers.write().unwrap().push(handler);
  }

  /// Largest body this pipeline admits.
  pub fn max_body_size(&self) -> u64 {
    self.max_body_size
  }

  /// Run the request chain. Any error aborts and fails the exchange.
  pub async fn process_request(
    &self,
    request: &mut Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()> {
    let body_len = request.body().map(|b| b.len() as u64).unwrap_or(0);
    if body_len > self.max_body_size {
      return Err(Error::PayloadTooLarge(body_len));
    }
    let handlers = self.request_handlers.read().unwrap().clone();
    for handler in handlers {
      handler.handle_request(request, ctx).await?;
    }
    tracing::debug!("[pipeline] request processed: {} {}", ctx.method, ctx.url);
    Ok(())
  }

  /// Run the response chain. Any error aborts and fails the exchange.
  pub async fn process_response(
    &self,
    response: &mut Response,
    request: &Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()> {
    let body_len = response.body().map(|b| b.len() as u64).unwrap_or(0);
    if body_len > self.max_body_size {
      return Err(Error::PayloadTooLarge(body_len));
    }
    let handlers = self.response_handlers.read().unwrap().clone();
    for handler in handlers {
      handler.handle_response(response, request, ctx).await?;
    }
    tracing::debug!(
      "[pipeline] response processed: {} {}",
      ctx.url,
      response.status_code()
    );
    Ok(())
  }
}

/// Logs one line per request and per response.
pub struct LoggingHandler;

#[async_trait]
impl RequestHandler for LoggingHandler {
  async fn handle_request(&self, request: &mut Request, ctx: &mut ExchangeContext) -> Result<()> {
    tracing::info!(
      "[request] {} {} {} from {}",
      request.method(),
      request.uri(),
      format!("{:?}", request.version()),
      ctx.client_ip
    );
    Ok(())
  }
}

#[async_trait]
impl ResponseHandler for LoggingHandler {
  async fn handle_response(
    &self,
    response: &mut Response,
    _request: &Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()> {
    tracing::info!("[response] {} {}", ctx.url, response.status_code());
    Ok(())
  }
}

/// Adds and removes request headers.
#[derive(Default)]
pub struct HeaderModifierHandler {
  /// Headers set on every request
  pub add: Vec<(HeaderName, HeaderValue)>,
  /// Headers removed from every request
  pub remove: Vec<HeaderName>,
}

#[async_trait]
impl RequestHandler for HeaderModifierHandler {
  async fn handle_request(&self, request: &mut Request, _ctx: &mut ExchangeContext) -> Result<()> {
    for (name, value) in &self.add {
      request.headers_mut().insert(name.clone(), value.clone());
    }
    for name in &self.remove {
      request.headers_mut().remove(name);
    }
    Ok(())
  }
}

const COMPRESSIBLE_TYPES: &[&str] = &[
  "text/",
  "application/json",
  "application/javascript",
  "application/xml",
  "application/xhtml+xml",
];

/// Gzips compressible response bodies that are not already encoded.
pub struct CompressionHandler {
  enabled: bool,
}

impl CompressionHandler {
  /// Create the handler; a disabled handler passes everything through.
  pub fn new(enabled: bool) -> Self {
    Self { enabled }
  }

  fn should_compress(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    COMPRESSIBLE_TYPES
      .iter()
      .any(|t| content_type.starts_with(t))
  }
}

#[async_trait]
impl ResponseHandler for CompressionHandler {
  async fn handle_response(
    &self,
    response: &mut Response,
    _request: &Request,
    _ctx: &mut ExchangeContext,
  ) -> Result<()> {
    if !self.enabled {
      return Ok(());
    }
    let compressible = response
      .headers()
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(Self::should_compress)
      .unwrap_or(false);
    if !compressible || response.headers().contains_key(http::header::CONTENT_ENCODING) {
      return Ok(());
    }
    let Some(body) = response.body() else {
      return Ok(());
    };
    let before = body.len();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).map_err(Error::Io)?;
    let compressed = encoder.finish().map_err(Error::Io)?;
    let after = compressed.len();
    response.headers_mut().insert(
      http::header::CONTENT_ENCODING,
      HeaderValue::from_static("gzip"),
    );
    response
      .headers_mut()
      .insert(http::header::CONTENT_LENGTH, HeaderValue::from(after));
    *response.body_mut() = Some(Body::from(compressed));
    tracing::debug!("[pipeline] compressed response: {} -> {} bytes", before, after);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use flate2::read::MultiGzDecoder;
  use std::io::Read;

  fn request() -> Request {
    http::Request::builder()
      .uri("http://example.com/")
      .body(Bytes::new())
      .unwrap()
      .into()
  }

  fn text_response(content_type: &str, body: &str) -> Response {
    http::Response::builder()
      .status(200)
      .header("Content-Type", content_type)
      .body(body.to_string())
      .unwrap()
      .into()
  }

  #[tokio::test]
  async fn compresses_text_bodies() {
    let handler = CompressionHandler::new(true);
    let request = request();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    let mut response = text_response("text/html; charset=utf-8", &"abc".repeat(100));
    handler
      .handle_response(&mut response, &request, &mut ctx)
      .await
      .unwrap();
    assert_eq!(
      response.headers().get(http::header::CONTENT_ENCODING).unwrap(),
      "gzip"
    );
    let mut decoded = String::new();
    MultiGzDecoder::new(response.body().unwrap().as_ref())
      .read_to_string(&mut decoded)
      .unwrap();
    assert_eq!(decoded, "abc".repeat(100));
  }

  #[tokio::test]
  async fn skips_binary_and_already_encoded() {
    let handler = CompressionHandler::new(true);
    let request = request();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    let mut binary = text_response("image/png", "not really a png");
    handler
      .handle_response(&mut binary, &request, &mut ctx)
      .await
      .unwrap();
    assert!(binary.headers().get(http::header::CONTENT_ENCODING).is_none());

    let mut encoded = text_response("text/plain", "data");
    encoded
      .headers_mut()
      .insert(http::header::CONTENT_ENCODING, HeaderValue::from_static("br"));
    handler
      .handle_response(&mut encoded, &request, &mut ctx)
      .await
      .unwrap();
    assert_eq!(
      encoded.headers().get(http::header::CONTENT_ENCODING).unwrap(),
      "br"
    );
  }

  #[tokio::test]
  async fn header_modifier_adds_and_removes() {
    let handler = HeaderModifierHandler {
      add: vec![(
        HeaderName::from_static("x-intercepted"),
        HeaderValue::from_static("1"),
      )],
      remove: vec![HeaderName::from_static("cookie")],
    };
    let mut request: Request = http::Request::builder()
      .uri("http://example.com/")
      .header("Cookie", "session=abc")
      .body(Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    handler.handle_request(&mut request, &mut ctx).await.unwrap();
    assert_eq!(request.headers().get("x-intercepted").unwrap(), "1");
    assert!(request.headers().get("cookie").is_none());
  }

  #[tokio::test]
  async fn oversize_request_fails_chain() {
    let pipeline = Pipeline::new(PipelineOptions { max_body_size: 8 });
    let mut request: Request = http::Request::builder()
      .method("POST")
      .uri("http://example.com/upload")
      .body(Bytes::from(vec![0u8; 64]))
      .unwrap()
      .into();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    assert!(matches!(
      pipeline.process_request(&mut request, &mut ctx).await,
      Err(Error::PayloadTooLarge(64))
    ));
  }

  #[tokio::test]
  async fn chain_aborts_on_first_error() {
    struct Failing;
    #[async_trait]
    impl RequestHandler for Failing {
      async fn handle_request(&self, _: &mut Request, _: &mut ExchangeContext) -> Result<()> {
        Err(Error::AccessDenied("nope".into()))
      }
    }
    struct Recording(Arc<std::sync::Mutex<bool>>);
    #[async_trait]
    impl RequestHandler for Recording {
      async fn handle_request(&self, _: &mut Request, _: &mut ExchangeContext) -> Result<()> {
        *self.0.lock().unwrap() = true;
        Ok(())
      }
    }
    let pipeline = Pipeline::new(PipelineOptions::default());
    let reached = Arc::new(std::sync::Mutex::new(false));
    pipeline.add_request_handler(Arc::new(Failing));
    pipeline.add_request_handler(Arc::new(Recording(Arc::clone(&reached))));
    let mut request = request();
    let mut ctx = ExchangeContext::new(&request, "10.0.0.1");
    assert!(pipeline.process_request(&mut request, &mut ctx).await.is_err());
    assert!(!*reached.lock().unwrap());
  }
}
