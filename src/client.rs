//! Upstream origin client
//!
//! One pooled connection store keyed by `scheme://host:port`. Redirects are
//! never followed; 3xx responses travel back to the caller verbatim.

use crate::arena::BufferArena;
use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::{Response, ResponseBuilder, ResponseConfig, ResponseFraming};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

/// A connection to an origin, plain or TLS.
pub(crate) enum Upstream {
  Tcp(TcpStream),
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Upstream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Upstream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      Upstream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Upstream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      Upstream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      Upstream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Upstream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      Upstream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Upstream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      Upstream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

// The proxy re-originates to arbitrary hosts whose certificates the operator
// never installed locally, so upstream verification is intentionally open.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

struct IdleConn {
  stream: Upstream,
  since: Instant,
}

struct ClientRef {
  tls: TlsConnector,
  pool: Mutex<HashMap<String, Vec<IdleConn>>>,
  max_idle_per_key: usize,
  idle_timeout: Duration,
  connect_timeout: Duration,
  upstream_timeout: Duration,
  max_body: u64,
  arena: BufferArena,
}

/// An origin client with keep-alive pooling. Cheap to clone.
#[derive(Clone)]
pub struct Client {
  inner: Arc<ClientRef>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
pub struct ClientBuilder {
  max_idle_per_key: usize,
  idle_timeout: Duration,
  connect_timeout: Duration,
  upstream_timeout: Duration,
  max_body: u64,
  arena: Option<BufferArena>,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self {
      max_idle_per_key: 20,
      idle_timeout: Duration::from_secs(90),
      connect_timeout: Duration::from_secs(10),
      upstream_timeout: Duration::from_secs(30),
      max_body: 10 * 1024 * 1024,
      arena: None,
    }
  }
}

impl ClientBuilder {
  /// Total per-exchange deadline covering connect, write and read.
  pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
    self.upstream_timeout = timeout;
    self
  }

  /// Deadline for establishing the TCP connection.
  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Idle sockets retained per `scheme://host:port` key.
  pub fn max_idle_per_key(mut self, max: usize) -> Self {
    self.max_idle_per_key = max;
    self
  }

  /// Age after which an idle socket is discarded instead of reused.
  pub fn idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = timeout;
    self
  }

  /// Largest response body the client will decode.
  pub fn max_body(mut self, max: u64) -> Self {
    self.max_body = max;
    self
  }

  /// Draw body scratch buffers from `arena`.
  pub fn arena(mut self, arena: BufferArena) -> Self {
    self.arena = Some(arena);
    self
  }

  /// Build the `Client`.
  pub fn build(self) -> Client {
    let mut config = ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Client {
      inner: Arc::new(ClientRef {
        tls: TlsConnector::from(Arc::new(config)),
        pool: Mutex::new(HashMap::new()),
        max_idle_per_key: self.max_idle_per_key,
        idle_timeout: self.idle_timeout,
        connect_timeout: self.connect_timeout,
        upstream_timeout: self.upstream_timeout,
        max_body: self.max_body,
        arena: self.arena.unwrap_or_default(),
      }),
    }
  }
}

impl Default for Client {
  fn default() -> Self {
    ClientBuilder::default().build()
  }
}

impl Client {
  /// Creates a `ClientBuilder` to configure a `Client`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::default()
  }

  fn pool_key(scheme: &str, host: &str, port: u16) -> String {
    format!("{}://{}:{}", scheme, host, port)
  }

  fn checkout(&self, key: &str) -> Option<Upstream> {
    let mut pool = self.inner.pool.lock().unwrap();
    let idle = pool.get_mut(key)?;
    while let Some(conn) = idle.pop() {
      if conn.since.elapsed() < self.inner.idle_timeout {
        return Some(conn.stream);
      }
    }
    None
  }

  fn check_in(&self, key: String, stream: Upstream) {
    let mut pool = self.inner.pool.lock().unwrap();
    let idle = pool.entry(key).or_default();
    if idle.len() < self.inner.max_idle_per_key {
      idle.push(IdleConn {
        stream,
        since: Instant::now(),
      });
    }
  }

  /// Open a fresh connection to `host:port`, wrapping it in TLS when the
  /// scheme is https.
  pub(crate) async fn connect(&self, scheme: &str, host: &str, port: u16) -> Result<Upstream> {
    let stream = tokio::time::timeout(
      self.inner.connect_timeout,
      TcpStream::connect((host, port)),
    )
    .await
    .map_err(|_| Error::UpstreamUnreachable(format!("{}:{} connect timed out", host, port)))?
    .map_err(|e| Error::UpstreamUnreachable(format!("{}:{}: {}", host, port, e)))?;
    let _ = stream.set_nodelay(true);
    if scheme == "https" {
      let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::UpstreamUnreachable(format!("invalid server name {}", host)))?;
      let tls_stream = self
        .inner
        .tls
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls_error(format!("{}:{}: {}", host, port, e)))?;
      Ok(Upstream::Tls(Box::new(tls_stream)))
    } else {
      Ok(Upstream::Tcp(stream))
    }
  }

  /// Send `request` to its origin and decode the response. The whole
  /// operation runs under the upstream budget; expiry maps to 504.
  pub async fn send(&self, request: &Request) -> Result<Response> {
    let scheme = request.uri().scheme_str().unwrap_or("http").to_string();
    let default_port = if scheme == "https" { 443 } else { 80 };
    let (host, port) = request.host_port(default_port)?;
    let key = Self::pool_key(&scheme, &host, port);
    let deadline = self.inner.upstream_timeout;
    match tokio::time::timeout(deadline, self.send_inner(request, &scheme, &host, port, &key))
      .await
    {
      Ok(result) => result,
      Err(_) => Err(Error::UpstreamTimeout),
    }
  }

  async fn send_inner(
    &self,
    request: &Request,
    scheme: &str,
    host: &str,
    port: u16,
    key: &str,
  ) -> Result<Response> {
    let raw = request.to_raw();
    // Pooled sockets may have gone stale under us; retry once on a fresh
    // connection before reporting the origin down.
    for attempt in 0..2 {
      let (stream, reused) = if attempt == 0 {
        match self.checkout(key) {
          Some(stream) => (stream, true),
          None => (self.connect(scheme, host, port).await?, false),
        }
      } else {
        (self.connect(scheme, host, port).await?, false)
      };
      match self.exchange(stream, request, &raw).await {
        Ok((response, stream, framing)) => {
          if self.reusable(request, &response, framing) {
            self.check_in(key.to_string(), stream);
          }
          return Ok(response);
        }
        Err(err) => {
          if reused {
            tracing::debug!("[client] pooled connection to {} failed: {}", key, err);
            continue;
          }
          return Err(err);
        }
      }
    }
    Err(Error::UpstreamUnreachable(format!("{} exhausted retries", key)))
  }

  async fn exchange(
    &self,
    mut stream: Upstream,
    request: &Request,
    raw: &[u8],
  ) -> Result<(Response, Upstream, ResponseFraming)> {
    stream
      .write_all(raw)
      .await
      .map_err(|e| Error::UpstreamUnreachable(format!("write failed: {}", e)))?;
    stream
      .flush()
      .await
      .map_err(|e| Error::UpstreamUnreachable(format!("flush failed: {}", e)))?;
    let builder = ResponseBuilder::new(
      BufReader::new(stream),
      ResponseConfig {
        method: request.method().clone(),
        max_body: self.inner.max_body,
        arena: self.inner.arena.clone(),
      },
    );
    builder.build().await.map_err(|e| match e {
      Error::PayloadTooLarge(n) => Error::PayloadTooLarge(n),
      Error::Io(io) => Error::UpstreamUnreachable(io.to_string()),
      other => other,
    })
  }

  fn reusable(&self, request: &Request, response: &Response, framing: ResponseFraming) -> bool {
    if !framing.explicit {
      return false;
    }
    let wants_close = |headers: &http::HeaderMap| {
      headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
    };
    !wants_close(request.headers()) && !wants_close(response.headers())
  }

  /// Idle sockets currently pooled, across all keys.
  pub fn idle_connections(&self) -> usize {
    self.inner.pool.lock().unwrap().values().map(Vec::len).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  async fn one_shot_origin(response: &'static [u8]) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let Ok((mut socket, _)) = listener.accept().await else {
          break;
        };
        tokio::spawn(async move {
          let mut buf = [0u8; 4096];
          let mut head = Vec::new();
          loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
              return;
            }
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
              break;
            }
          }
          let _ = socket.write_all(response).await;
        });
      }
    });
    addr
  }

  #[tokio::test]
  async fn relays_and_pools_keepalive_responses() {
    let addr =
      one_shot_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let client = Client::builder().build();
    let request: Request = http::Request::builder()
      .uri(format!("http://{}/", addr))
      .body(Bytes::new())
      .unwrap()
      .into();
    let response = client.send(&request).await.unwrap();
    assert_eq!(response.status_code(), http::StatusCode::OK);
    assert_eq!(response.text(), "ok");
    assert_eq!(client.idle_connections(), 1);
  }

  #[tokio::test]
  async fn close_delimited_responses_are_not_pooled() {
    let addr = one_shot_origin(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok")
      .await;
    let client = Client::builder().build();
    let request: Request = http::Request::builder()
      .uri(format!("http://{}/", addr))
      .body(Bytes::new())
      .unwrap()
      .into();
    let response = client.send(&request).await.unwrap();
    assert_eq!(response.text(), "ok");
    assert_eq!(client.idle_connections(), 0);
  }

  #[tokio::test]
  async fn unreachable_origin_maps_to_502_class_error() {
    let client = Client::builder()
      .connect_timeout(Duration::from_millis(200))
      .build();
    let request: Request = http::Request::builder()
      // TEST-NET-1, nothing listens there.
      .uri("http://192.0.2.1:9/")
      .body(Bytes::new())
      .unwrap()
      .into();
    let err = client.send(&request).await.unwrap_err();
    assert!(matches!(
      err,
      Error::UpstreamUnreachable(_) | Error::UpstreamTimeout
    ));
  }
}
