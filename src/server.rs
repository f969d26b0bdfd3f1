//! Connection engine
//!
//! The accept loop spawns one task per client connection. Each request is
//! classified into plain HTTP relay, CONNECT interception or WebSocket
//! splice; intercepted exchanges run the access gates, both handler chains
//! and the optional fingerprint tee before bytes reach the client.

use crate::access::AccessControl;
use crate::arena::BufferArena;
use crate::ca::{CertManager, CertOptions};
use crate::cache::CacheStats;
use crate::client::Client;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::extension::{ExtensionHost, FilterContext};
use crate::fingerprint::{extract_title, FingerprintEngine, FingerprintOptions, HttpSample};
use crate::metrics::Metrics;
use crate::pattern::{PatternHandler, PatternRecognizer};
use crate::pipeline::{
  CompressionHandler, ExchangeContext, LoggingHandler, Pipeline, PipelineOptions,
};
use crate::request::{read_request, ReadLimits, Request};
use crate::response::Response;
use http::{HeaderValue, Method, Uri, Version};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

const DRAIN_BUDGET: Duration = Duration::from_secs(30);
const FINGERPRINT_BODY_CAP: usize = 1024 * 1024;
const SCAVENGE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const EVICT_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct ServerInner {
  config: Config,
  certs: Arc<CertManager>,
  access: AccessControl,
  pipeline: Arc<Pipeline>,
  extensions: Arc<ExtensionHost>,
  recognizer: Arc<PatternRecognizer>,
  fingerprint: Option<Arc<FingerprintEngine>>,
  metrics: Metrics,
  arena: BufferArena,
  client: Client,
  shutdown: watch::Sender<bool>,
  maintenance: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ServerInner {
  fn limits(&self) -> ReadLimits {
    ReadLimits {
      max_head: 64 * 1024,
      max_body: self.pipeline.max_body_size(),
    }
  }
}

impl Drop for ServerInner {
  fn drop(&mut self) {
    for task in self.maintenance.lock().unwrap().drain(..) {
      task.abort();
    }
  }
}

/// The intercepting proxy server. Cheap to clone; all clones share one
/// engine.
#[derive(Clone)]
pub struct ProxyServer {
  inner: Arc<ServerInner>,
}

/// Builder for [`ProxyServer`]. Collaborators not supplied explicitly are
/// constructed from the configuration.
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Config,
  certs: Option<Arc<CertManager>>,
  access: Option<AccessControl>,
  pipeline: Option<Arc<Pipeline>>,
  extensions: Option<Arc<ExtensionHost>>,
  recognizer: Option<Arc<PatternRecognizer>>,
  fingerprint: Option<Arc<FingerprintEngine>>,
  metrics: Option<Metrics>,
  arena: Option<BufferArena>,
  client: Option<Client>,
}

impl ProxyServerBuilder {
  /// Set the configuration.
  pub fn config(mut self, config: Config) -> Self {
    self.config = config;
    self
  }

  /// Use a pre-built certificate manager.
  pub fn cert_manager(mut self, certs: Arc<CertManager>) -> Self {
    self.certs = Some(certs);
    self
  }

  /// Use a pre-built access controller.
  pub fn access_control(mut self, access: AccessControl) -> Self {
    self.access = Some(access);
    self
  }

  /// Use a pre-built pipeline instead of the default chains.
  pub fn pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
    self.pipeline = Some(pipeline);
    self
  }

  /// Use a pre-populated extension host.
  pub fn extension_host(mut self, extensions: Arc<ExtensionHost>) -> Self {
    self.extensions = Some(extensions);
    self
  }

  /// Use a pre-built pattern recogniser.
  pub fn pattern_recognizer(mut self, recognizer: Arc<PatternRecognizer>) -> Self {
    self.recognizer = Some(recognizer);
    self
  }

  /// Use a pre-loaded fingerprint engine.
  pub fn fingerprint_engine(mut self, engine: Arc<FingerprintEngine>) -> Self {
    self.fingerprint = Some(engine);
    self
  }

  /// Share metrics with the embedding binary.
  pub fn metrics(mut self, metrics: Metrics) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Share a buffer arena.
  pub fn arena(mut self, arena: BufferArena) -> Self {
    self.arena = Some(arena);
    self
  }

  /// Use a pre-built upstream client.
  pub fn client(mut self, client: Client) -> Self {
    self.client = Some(client);
    self
  }

  /// Assemble the server, loading the CA, the configured extensions and the
  /// fingerprint database as needed.
  pub async fn build(self) -> Result<ProxyServer> {
    let config = self.config;
    config.validate()?;
    let arena = self.arena.unwrap_or_default();
    let metrics = self.metrics.unwrap_or_default();
    let certs = match self.certs {
      Some(certs) => certs,
      None => Arc::new(
        CertManager::new(CertOptions {
          cert_dir: config.tls.cert_dir.clone(),
          enable_cache: config.tls.enable_cert_cache,
          cache_ttl: Duration::from_secs(config.tls.cert_cache_ttl),
          cache_capacity: 1000,
        })
        .await?,
      ),
    };
    let access = self
      .access
      .unwrap_or_else(|| AccessControl::new(&config.security));
    let recognizer = self
      .recognizer
      .unwrap_or_else(|| Arc::new(PatternRecognizer::with_default_patterns()));
    let pipeline = match self.pipeline {
      Some(pipeline) => pipeline,
      None => {
        let pipeline = Pipeline::new(PipelineOptions::default());
        pipeline.add_request_handler(Arc::new(LoggingHandler));
        pipeline.add_response_handler(Arc::new(LoggingHandler));
        if config.proxy.enable_compression {
          pipeline.add_response_handler(Arc::new(CompressionHandler::new(true)));
        }
        pipeline.add_response_handler(Arc::new(PatternHandler::new(Arc::clone(&recognizer))));
        Arc::new(pipeline)
      }
    };
    let client = self.client.unwrap_or_else(|| {
      Client::builder()
        .upstream_timeout(config.upstream_timeout())
        .max_body(pipeline.max_body_size())
        .arena(arena.clone())
        .build()
    });
    let extensions = self.extensions.unwrap_or_default();
    if config.plugins.enabled {
      extensions.load_all(&config.plugins).await?;
    }
    let fingerprint = match self.fingerprint {
      Some(engine) => Some(engine),
      None if config.fingerprint.enabled => Some(Arc::new(
        FingerprintEngine::from_file(
          &config.fingerprint.database,
          FingerprintOptions {
            cache_size: config.fingerprint.cache_size,
            cache_ttl: Duration::from_secs(config.fingerprint.cache_ttl),
            max_matches: config.fingerprint.max_matches,
          },
        )
        .await?,
      )),
      None => None,
    };

    let mut maintenance = vec![
      arena.spawn_maintenance(EVICT_INTERVAL),
      access.spawn_evictor(EVICT_INTERVAL),
    ];
    if let Some(task) = certs.spawn_scavenger(SCAVENGE_INTERVAL) {
      maintenance.push(task);
    }
    if let Some(engine) = &fingerprint {
      maintenance.push(engine.spawn_scavenger(SCAVENGE_INTERVAL));
    }

    let (shutdown, _) = watch::channel(false);
    Ok(ProxyServer {
      inner: Arc::new(ServerInner {
        config,
        certs,
        access,
        pipeline,
        extensions,
        recognizer,
        fingerprint,
        metrics,
        arena,
        client,
        shutdown,
        maintenance: Mutex::new(maintenance),
      }),
    })
  }
}

impl ProxyServer {
  /// Start building a server.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// Assemble a server entirely from configuration.
  pub async fn from_config(config: Config) -> Result<Self> {
    Self::builder().config(config).build().await
  }

  /// Shared traffic counters.
  pub fn metrics(&self) -> &Metrics {
    &self.inner.metrics
  }

  /// The access controller, for runtime list and auth changes.
  pub fn access_control(&self) -> &AccessControl {
    &self.inner.access
  }

  /// The extension host, for module registration and lifecycle calls.
  pub fn extension_host(&self) -> &Arc<ExtensionHost> {
    &self.inner.extensions
  }

  /// The certificate manager.
  pub fn cert_manager(&self) -> &Arc<CertManager> {
    &self.inner.certs
  }

  /// The pattern recogniser.
  pub fn pattern_recognizer(&self) -> &Arc<PatternRecognizer> {
    &self.inner.recognizer
  }

  /// Root certificate in PEM form for client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    self.inner.certs.ca_cert_pem()
  }

  /// Leaf cache counters, when caching is enabled.
  pub fn cert_cache_stats(&self) -> Option<CacheStats> {
    self.inner.certs.cache_stats()
  }

  /// Stop accepting, drain in-flight exchanges, abort stragglers.
  pub fn shutdown(&self) {
    let _ = self.inner.shutdown.send(true);
  }

  /// Bind the configured address and serve until shutdown.
  pub async fn run(&self) -> Result<()> {
    let listener = TcpListener::bind(self.inner.config.listen_addr()).await?;
    self.run_with_listener(listener).await
  }

  /// Serve on an already bound listener until shutdown.
  pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
    tracing::info!("[proxy] listening on {}", listener.local_addr()?);
    let mut shutdown = self.inner.shutdown.subscribe();
    let mut connections = JoinSet::new();
    loop {
      tokio::select! {
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              let inner = Arc::clone(&self.inner);
              connections.spawn(async move {
                inner.metrics.connection_opened();
                if let Err(e) = serve_plain(&inner, stream, peer).await {
                  tracing::debug!("[proxy] connection from {} ended: {}", peer, e);
                }
                inner.metrics.connection_closed();
              });
            }
            Err(e) => tracing::error!("[proxy] accept failed: {}", e),
          }
        }
      }
      while connections.try_join_next().is_some() {}
    }
    if !connections.is_empty() {
      tracing::info!("[proxy] draining {} connections", connections.len());
      let drain = async {
        while connections.join_next().await.is_some() {}
      };
      if tokio::time::timeout(DRAIN_BUDGET, drain).await.is_err() {
        connections.abort_all();
      }
    }
    tracing::info!("[proxy] stopped");
    Ok(())
  }
}

struct ConnState {
  request_count: u64,
  last_request: Option<SystemTime>,
}

impl ConnState {
  fn new() -> Self {
    Self {
      request_count: 0,
      last_request: None,
    }
  }

  fn filter_context(&mut self, request: &Request, client_ip: &str) -> FilterContext {
    self.request_count += 1;
    let previous = self.last_request;
    self.last_request = Some(SystemTime::now());
    FilterContext {
      client_ip: client_ip.to_string(),
      user_agent: request
        .headers()
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string(),
      request_count: self.request_count,
      last_request: previous,
      metadata: Default::default(),
    }
  }
}

async fn next_request<S>(
  inner: &Arc<ServerInner>,
  stream: &mut S,
  limits: &ReadLimits,
) -> Result<Option<Request>>
where
  S: AsyncRead + Unpin,
{
  match tokio::time::timeout(
    inner.config.read_timeout(),
    read_request(stream, limits, &inner.arena),
  )
  .await
  {
    // Idle past the read deadline closes the connection quietly.
    Err(_) => Ok(None),
    Ok(result) => result,
  }
}

/// Swallow whatever the client already sent so the closing error response
/// is not clobbered by a reset.
async fn drain_remaining<S>(stream: &mut S)
where
  S: AsyncRead + Unpin,
{
  let mut sink = [0u8; 8 * 1024];
  let _ = tokio::time::timeout(Duration::from_secs(2), async {
    loop {
      match stream.read(&mut sink).await {
        Ok(0) | Err(_) => break,
        Ok(_) => {}
      }
    }
  })
  .await;
}

async fn serve_plain(
  inner: &Arc<ServerInner>,
  mut stream: TcpStream,
  peer: SocketAddr,
) -> Result<()> {
  let limits = inner.limits();
  let mut state = ConnState::new();
  loop {
    let request = match next_request(inner, &mut stream, &limits).await {
      Ok(Some(request)) => request,
      Ok(None) => return Ok(()),
      Err(e) => {
        inner.metrics.record_error();
        let _ = write_error_response(inner, &mut stream, &e).await;
        drain_remaining(&mut stream).await;
        return Ok(());
      }
    };
    inner.metrics.record_request(request.raw().len() as u64);
    if request.method() == Method::CONNECT {
      return handle_connect(inner, stream, request, peer).await;
    }
    let client_ip = AccessControl::client_ip(request.headers(), peer);
    if let Err(e) = gate(inner, &request, &client_ip, &mut state).await {
      let _ = write_error_response(inner, &mut stream, &e).await;
      return Ok(());
    }
    if !inner.config.proxy.enable_http {
      let e = Error::AccessDenied("plain http proxying is disabled".into());
      let _ = write_error_response(inner, &mut stream, &e).await;
      return Ok(());
    }
    if request.is_websocket_upgrade() && inner.config.proxy.enable_websocket {
      return splice_websocket(inner, stream, request, "http").await;
    }
    let close = process_exchange(inner, &mut stream, request, &client_ip, "http", None).await?;
    if close {
      return Ok(());
    }
  }
}

async fn serve_tls<S>(
  inner: &Arc<ServerInner>,
  mut stream: S,
  peer: SocketAddr,
  authority: String,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let limits = inner.limits();
  let mut state = ConnState::new();
  loop {
    let request = match next_request(inner, &mut stream, &limits).await {
      Ok(Some(request)) => request,
      Ok(None) => return Ok(()),
      Err(e) => {
        inner.metrics.record_error();
        let _ = write_error_response(inner, &mut stream, &e).await;
        drain_remaining(&mut stream).await;
        return Ok(());
      }
    };
    inner.metrics.record_request(request.raw().len() as u64);
    if request.method() == Method::CONNECT {
      let e = Error::protocol("CONNECT inside an established tunnel");
      let _ = write_error_response(inner, &mut stream, &e).await;
      return Ok(());
    }
    let client_ip = AccessControl::client_ip(request.headers(), peer);
    if let Err(e) = gate(inner, &request, &client_ip, &mut state).await {
      let _ = write_error_response(inner, &mut stream, &e).await;
      return Ok(());
    }
    if request.is_websocket_upgrade() && inner.config.proxy.enable_websocket {
      return splice_websocket(inner, stream, request, "https").await;
    }
    let close = process_exchange(
      inner,
      &mut stream,
      request,
      &client_ip,
      "https",
      Some(authority.as_str()),
    )
    .await?;
    if close {
      return Ok(());
    }
  }
}

/// Access controller plus extension filter chain, in that order.
async fn gate(
  inner: &Arc<ServerInner>,
  request: &Request,
  client_ip: &str,
  state: &mut ConnState,
) -> Result<()> {
  if let Err(e) = inner.access.is_allowed(request.headers(), client_ip) {
    inner.metrics.record_error();
    inner.extensions.log_error(&e).await;
    return Err(e);
  }
  let filter_ctx = state.filter_context(request, client_ip);
  match inner.extensions.should_allow(request, &filter_ctx).await {
    Ok(true) => Ok(()),
    Ok(false) => {
      inner.metrics.record_error();
      Err(Error::AccessDenied(format!(
        "{} filtered by extension",
        client_ip
      )))
    }
    Err(e) => {
      inner.metrics.record_error();
      inner.extensions.log_error(&e).await;
      Err(e)
    }
  }
}

async fn handle_connect(
  inner: &Arc<ServerInner>,
  mut stream: TcpStream,
  request: Request,
  peer: SocketAddr,
) -> Result<()> {
  let client_ip = AccessControl::client_ip(request.headers(), peer);
  if let Err(e) = inner.access.is_allowed(request.headers(), &client_ip) {
    inner.metrics.record_error();
    inner.extensions.log_error(&e).await;
    let _ = write_error_response(inner, &mut stream, &e).await;
    return Ok(());
  }
  let (host, port) = request.host_port(443)?;
  tracing::debug!("[proxy] CONNECT {}:{} from {}", host, port, client_ip);
  if !inner.config.proxy.enable_https {
    return tunnel_passthrough(inner, stream, &host, port).await;
  }
  let leaf = match inner.certs.get_certificate(&host) {
    Ok(leaf) => leaf,
    Err(e) => {
      // A single host failing to mint falls back to a blind tunnel.
      tracing::warn!("[proxy] leaf mint for {} failed ({}), tunnelling", host, e);
      return tunnel_passthrough(inner, stream, &host, port).await;
    }
  };
  stream
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  stream.flush().await?;
  let acceptor = TlsAcceptor::from(Arc::clone(&leaf.server_config));
  let tls_stream = acceptor
    .accept(stream)
    .await
    .map_err(|e| Error::tls_error(format!("{}: {}", host, e)))?;
  let authority = if port == 443 {
    host
  } else {
    format!("{}:{}", host, port)
  };
  serve_tls(inner, tls_stream, peer, authority).await
}

async fn tunnel_passthrough(
  inner: &Arc<ServerInner>,
  mut client: TcpStream,
  host: &str,
  port: u16,
) -> Result<()> {
  let mut backend = match TcpStream::connect((host, port)).await {
    Ok(backend) => backend,
    Err(e) => {
      let err = Error::UpstreamUnreachable(format!("{}:{}: {}", host, port, e));
      inner.metrics.record_error();
      let _ = write_error_response(inner, &mut client, &err).await;
      return Ok(());
    }
  };
  client
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  client.flush().await?;
  let (sent, received) = copy_bidirectional(&mut client, &mut backend)
    .await
    .unwrap_or((0, 0));
  inner.metrics.record_transfer(sent, received);
  Ok(())
}

async fn splice_websocket<S>(
  inner: &Arc<ServerInner>,
  mut client: S,
  request: Request,
  scheme: &str,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let default_port = if scheme == "https" { 443 } else { 80 };
  let (host, port) = request.host_port(default_port)?;
  tracing::debug!("[proxy] websocket splice to {}:{}", host, port);
  let mut backend = match inner.client.connect(scheme, &host, port).await {
    Ok(backend) => backend,
    Err(e) => {
      inner.metrics.record_error();
      let _ = write_error_response(inner, &mut client, &e).await;
      return Ok(());
    }
  };
  // The upgrade head travels verbatim; frames are spliced, not inspected.
  backend.write_all(request.raw()).await?;
  backend.flush().await?;
  let (sent, received) = copy_bidirectional(&mut client, &mut backend)
    .await
    .unwrap_or((0, 0));
  inner.metrics.record_transfer(sent, received);
  Ok(())
}

async fn process_exchange<S>(
  inner: &Arc<ServerInner>,
  stream: &mut S,
  mut request: Request,
  client_ip: &str,
  scheme: &str,
  authority: Option<&str>,
) -> Result<bool>
where
  S: AsyncWrite + Unpin,
{
  let close_after = client_wants_close(&request);
  match run_exchange(inner, &mut request, client_ip, scheme, authority).await {
    Ok((mut response, ctx)) => {
      frame_response(&mut response, close_after);
      let raw = response.to_raw();
      tokio::time::timeout(inner.config.write_timeout(), stream.write_all(&raw))
        .await
        .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??;
      stream.flush().await?;
      inner.metrics.record_response(
        response.status_code().as_u16(),
        raw.len() as u64,
        ctx.start_time.elapsed(),
      );
      if let Some(engine) = &inner.fingerprint {
        spawn_fingerprint(inner, Arc::clone(engine), &ctx.url, &response);
      }
      Ok(close_after)
    }
    Err(e) => {
      inner.metrics.record_error();
      inner.extensions.log_error(&e).await;
      let status = e.status_code();
      inner
        .metrics
        .record_response(status.as_u16(), 0, Duration::ZERO);
      let _ = write_error_response(inner, stream, &e).await;
      Ok(true)
    }
  }
}

async fn run_exchange(
  inner: &Arc<ServerInner>,
  request: &mut Request,
  client_ip: &str,
  scheme: &str,
  authority: Option<&str>,
) -> Result<(Response, ExchangeContext)> {
  absolutize(request, scheme, authority)?;
  let mut ctx = ExchangeContext::new(request, client_ip);
  strip_hop_by_hop(request.headers_mut());
  inner.pipeline.process_request(request, &mut ctx).await?;
  inner.extensions.process_request(request, &mut ctx).await?;
  inner.extensions.log_request(request, &ctx).await;
  let mut response = inner.client.send(request).await?;
  strip_hop_by_hop(response.headers_mut());
  inner
    .pipeline
    .process_response(&mut response, request, &mut ctx)
    .await?;
  inner
    .extensions
    .process_response(&mut response, request, &mut ctx)
    .await?;
  inner.extensions.log_response(&response, request, &ctx).await;
  let _ = inner.extensions.analyze_response(&response, request, &ctx).await;
  ctx.record_response(&response);
  Ok((response, ctx))
}

/// Give the request an absolute URI: plain proxy requests may arrive in
/// absolute form already, tunnelled ones carry only the origin-form path.
fn absolutize(request: &mut Request, scheme: &str, authority: Option<&str>) -> Result<()> {
  let uri = request.uri().clone();
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Ok(());
  }
  let authority = authority
    .map(str::to_string)
    .or_else(|| {
      request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    })
    .or_else(|| uri.authority().map(|a| a.to_string()))
    .ok_or_else(|| Error::protocol("request carries no target host"))?;
  let path_and_query = uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  *request.uri_mut() = Uri::builder()
    .scheme(scheme)
    .authority(authority)
    .path_and_query(path_and_query)
    .build()?;
  Ok(())
}

const HOP_BY_HOP: &[&str] = &[
  "connection",
  "proxy-authorization",
  "proxy-connection",
  "keep-alive",
  "te",
  "trailer",
  "transfer-encoding",
];

/// Remove hop-by-hop headers; `Upgrade` survives only for websockets.
pub(crate) fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
  for name in HOP_BY_HOP {
    headers.remove(*name);
  }
  let websocket = headers
    .get(http::header::UPGRADE)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("websocket"))
    .unwrap_or(false);
  if !websocket {
    headers.remove(http::header::UPGRADE);
  }
}

fn client_wants_close(request: &Request) -> bool {
  match request
    .headers()
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
  {
    Some(value) if value.eq_ignore_ascii_case("close") => true,
    Some(_) => false,
    None => request.version() == Version::HTTP_10,
  }
}

/// Re-frame the processed response for the client: explicit
/// `Content-Length`, explicit connection intent.
fn frame_response(response: &mut Response, close: bool) {
  if response.allows_body() {
    let len = response.body().map(|b| b.len()).unwrap_or(0);
    response
      .headers_mut()
      .insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
  } else {
    response.headers_mut().remove(http::header::CONTENT_LENGTH);
  }
  let intent = if close { "close" } else { "keep-alive" };
  response
    .headers_mut()
    .insert(http::header::CONNECTION, HeaderValue::from_static(intent));
}

async fn write_error_response<S>(
  inner: &Arc<ServerInner>,
  stream: &mut S,
  error: &Error,
) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  let status = error.status_code();
  let body = status
    .canonical_reason()
    .unwrap_or("proxy error")
    .to_string();
  let mut head = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or(""),
    body.len(),
  );
  if matches!(error, Error::AuthFailed(_)) {
    head.push_str("Proxy-Authenticate: Basic realm=\"snare\"\r\n");
  }
  head.push_str("\r\n");
  head.push_str(&body);
  tokio::time::timeout(inner.config.write_timeout(), stream.write_all(head.as_bytes()))
    .await
    .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??;
  stream.flush().await?;
  Ok(())
}

fn spawn_fingerprint(
  inner: &Arc<ServerInner>,
  engine: Arc<FingerprintEngine>,
  url: &str,
  response: &Response,
) {
  let status = response.status_code();
  let headers: BTreeMap<String, String> = response
    .headers()
    .iter()
    .filter_map(|(k, v)| {
      v.to_str()
        .ok()
        .map(|s| (k.as_str().to_ascii_lowercase(), s.to_string()))
    })
    .collect();
  let body = response.body().map(|b| b.as_ref()).unwrap_or(&[]);
  let take = body.len().min(FINGERPRINT_BODY_CAP);
  let mut tee = inner.arena.acquire(take.max(1));
  tee[..take].copy_from_slice(&body[..take]);
  let url = url.to_string();
  // Identification must never hold up the client stream.
  tokio::spawn(async move {
    let body = String::from_utf8_lossy(&tee[..take]).into_owned();
    drop(tee);
    let title = extract_title(&body);
    let sample = HttpSample {
      url: url.clone(),
      status: status.as_u16(),
      headers,
      body,
      title,
    };
    let result = engine.identify(&sample);
    if !result.matched.is_empty() {
      tracing::info!(
        "[fingerprint] {} -> {} ({:.0}% in {:?})",
        url,
        result.matched.join(", "),
        result.confidence * 100.0,
        result.elapsed
      );
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  #[test]
  fn hop_by_hop_headers_are_stripped() {
    let mut headers = http::HeaderMap::new();
    for (name, value) in [
      ("Connection", "keep-alive"),
      ("Proxy-Authorization", "Basic Zm9vOmJhcg=="),
      ("Proxy-Connection", "keep-alive"),
      ("Keep-Alive", "timeout=5"),
      ("TE", "trailers"),
      ("Trailer", "Expires"),
      ("Transfer-Encoding", "chunked"),
      ("Upgrade", "h2c"),
      ("Accept", "text/html"),
    ] {
      headers.insert(name, HeaderValue::from_static(value));
    }
    strip_hop_by_hop(&mut headers);
    assert_eq!(headers.len(), 1);
    assert!(headers.contains_key("accept"));
  }

  #[test]
  fn websocket_upgrade_header_survives() {
    let mut headers = http::HeaderMap::new();
    headers.insert("Upgrade", HeaderValue::from_static("websocket"));
    headers.insert("Connection", HeaderValue::from_static("Upgrade"));
    strip_hop_by_hop(&mut headers);
    assert_eq!(headers.get("upgrade").unwrap(), "websocket");
    assert!(!headers.contains_key("connection"));
  }

  #[test]
  fn absolutize_prefers_tunnel_authority() {
    let mut request: Request = http::Request::builder()
      .uri("/index.html")
      .header("Host", "ignored.example.com")
      .body(Bytes::new())
      .unwrap()
      .into();
    absolutize(&mut request, "https", Some("real.example.com:8443")).unwrap();
    assert_eq!(
      request.uri().to_string(),
      "https://real.example.com:8443/index.html"
    );
  }

  #[test]
  fn absolutize_falls_back_to_host_header() {
    let mut request: Request = http::Request::builder()
      .uri("/a")
      .header("Host", "example.com")
      .body(Bytes::new())
      .unwrap()
      .into();
    absolutize(&mut request, "http", None).unwrap();
    assert_eq!(request.uri().to_string(), "http://example.com/a");
  }

  #[test]
  fn close_semantics() {
    let close: Request = http::Request::builder()
      .uri("http://a/")
      .header("Connection", "close")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert!(client_wants_close(&close));
    let keep: Request = http::Request::builder()
      .uri("http://a/")
      .header("Connection", "keep-alive")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert!(!client_wants_close(&keep));
  }

  #[test]
  fn frame_sets_length_and_intent() {
    let mut response: Response = http::Response::builder()
      .status(200)
      .body("hello".to_string())
      .unwrap()
      .into();
    frame_response(&mut response, false);
    assert_eq!(response.headers().get(http::header::CONTENT_LENGTH).unwrap(), "5");
    assert_eq!(response.headers().get(http::header::CONNECTION).unwrap(), "keep-alive");
    let mut empty: Response = http::Response::builder()
      .status(304)
      .body(String::new())
      .unwrap()
      .into();
    frame_response(&mut empty, true);
    assert!(empty.headers().get(http::header::CONTENT_LENGTH).is_none());
    assert_eq!(empty.headers().get(http::header::CONNECTION).unwrap(), "close");
  }
}
