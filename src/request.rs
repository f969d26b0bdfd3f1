use crate::arena::BufferArena;
use crate::body::Body;
use crate::errors::{Error, Result};
use crate::response::parser_headers;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use std::fmt::{Debug, Formatter};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A decoded client request travelling through the interception pipeline.
#[derive(Clone, Default)]
pub struct Request {
  uri: Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  // Verbatim head+body as read off the wire, forwarded unmodified on
  // WebSocket upgrades.
  raw: Bytes,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<http::Request<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: http::Request<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
      raw: Bytes::new(),
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`.
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// The HTTP method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Mutable access to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }

  /// The request URI. Absolute once the engine has fixed up scheme and host.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// Mutable access to the request URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }

  /// The request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Mutable access to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// The request body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Mutable access to the request body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }

  /// The HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The head and body exactly as read off the wire. Empty for requests
  /// constructed in code.
  #[inline]
  pub(crate) fn raw(&self) -> &Bytes {
    &self.raw
  }

  /// Whether this request asks for a WebSocket upgrade.
  pub fn is_websocket_upgrade(&self) -> bool {
    let upgrade = self
      .headers
      .get(http::header::UPGRADE)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.eq_ignore_ascii_case("websocket"))
      .unwrap_or(false);
    let connection = self
      .headers
      .get(http::header::CONNECTION)
      .and_then(|v| v.to_str().ok())
      .map(|v| {
        v.split(',')
          .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
      })
      .unwrap_or(false);
    upgrade && connection
  }

  /// Target host and port, from the URI authority or the `Host` header.
  pub fn host_port(&self, default_port: u16) -> Result<(String, u16)> {
    if let Some(authority) = self.uri.authority() {
      let host = authority.host().to_string();
      let port = authority.port_u16().unwrap_or(default_port);
      return Ok((host, port));
    }
    let host_header = self
      .headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::protocol("request carries no target host"))?;
    match host_header.rsplit_once(':') {
      Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => Ok((
        host.to_string(),
        port
          .parse()
          .map_err(|_| Error::protocol(format!("invalid port in host {}", host_header)))?,
      )),
      _ => Ok((host_header.to_string(), default_port)),
    }
  }

  /// Serialise the request in origin-form for the upstream socket. Inserts
  /// `Host` and `Content-Length` when absent.
  pub fn to_raw(&self) -> Bytes {
    let mut wire = Vec::new();
    wire.extend(self.method.as_str().as_bytes());
    wire.extend(SPACE);
    wire.extend(self.uri.path().as_bytes());
    if let Some(q) = self.uri.query() {
      wire.push(b'?');
      wire.extend(q.as_bytes());
    }
    wire.extend(SPACE);
    wire.extend(format!("{:?}", self.version).as_bytes());
    wire.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      wire.extend(http::header::HOST.as_str().as_bytes());
      wire.extend(COLON_SPACE);
      if let Some(authority) = self.uri.authority() {
        wire.extend(authority.as_str().as_bytes());
      }
      wire.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if let Some(body) = self.body() {
      if !body.is_empty() {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(body.len()));
      }
    }
    for (k, v) in headers.iter() {
      wire.extend(k.as_str().as_bytes());
      wire.extend(COLON_SPACE);
      wire.extend(v.as_bytes());
      wire.extend(CR_LF);
    }
    wire.extend(CR_LF);
    if let Some(body) = self.body() {
      wire.extend(body.as_ref());
    }
    Bytes::from(wire)
  }
}

/// Bounds enforced while decoding a request off the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadLimits {
  pub max_head: usize,
  pub max_body: u64,
}

impl Default for ReadLimits {
  fn default() -> Self {
    Self {
      max_head: 64 * 1024,
      max_body: 10 * 1024 * 1024,
    }
  }
}

/// Read one request head byte-by-byte so nothing beyond the message is
/// consumed; the stream must stay positioned for a TLS hello or spliced
/// frames.
async fn read_head<S>(stream: &mut S, limit: usize) -> Result<Option<Vec<u8>>>
where
  S: AsyncRead + Unpin,
{
  let mut head = Vec::with_capacity(512);
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await?;
    if n == 0 {
      if head.is_empty() {
        return Ok(None);
      }
      return Err(Error::protocol("connection closed inside request head"));
    }
    head.push(byte[0]);
    if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
      return Ok(Some(head));
    }
    if head.len() > limit {
      return Err(Error::protocol("request head exceeds maximum size"));
    }
  }
}

fn parse_head(head: &[u8]) -> Result<(Method, String, Version, HeaderMap)> {
  let mut lines = head.split(|b| *b == b'\n');
  let request_line = lines
    .next()
    .ok_or_else(|| Error::protocol("empty request"))?;
  let request_line = request_line.strip_suffix(b"\r").unwrap_or(request_line);
  let text = std::str::from_utf8(request_line)
    .map_err(|_| Error::protocol("request line is not valid UTF-8"))?;
  let mut parts = text.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::protocol(format!("malformed request line: {}", text))),
  };
  let method =
    Method::from_bytes(method.as_bytes()).map_err(|_| Error::protocol("invalid method"))?;
  let version = match version {
    "HTTP/1.0" => Version::HTTP_10,
    "HTTP/1.1" => Version::HTTP_11,
    other => {
      return Err(Error::protocol(format!("unsupported version {}", other)));
    }
  };
  let mut headers = HeaderMap::new();
  for line in lines {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
      break;
    }
    if let Ok((Some(k), Some(v))) = parser_headers(line) {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    }
  }
  Ok((method, target.to_string(), version, headers))
}

async fn read_exact_body<S>(
  stream: &mut S,
  length: usize,
  arena: &BufferArena,
) -> Result<Vec<u8>>
where
  S: AsyncRead + Unpin,
{
  let mut body = Vec::with_capacity(length);
  let mut scratch = arena.acquire(length.clamp(1, 64 * 1024));
  let mut remaining = length;
  while remaining > 0 {
    let take = remaining.min(scratch.len());
    let n = stream.read(&mut scratch[..take]).await?;
    if n == 0 {
      return Err(Error::protocol("connection closed inside request body"));
    }
    body.extend_from_slice(&scratch[..n]);
    remaining -= n;
  }
  Ok(body)
}

async fn read_chunked_body<S>(stream: &mut S, max_body: u64) -> Result<Vec<u8>>
where
  S: AsyncRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
      let n = stream.read(&mut byte).await?;
      if n == 0 {
        return Err(Error::protocol("connection closed inside chunked body"));
      }
      if byte[0] == b'\n' {
        break;
      }
      if byte[0] != b'\r' {
        size_line.push(byte[0]);
      }
      if size_line.len() > 16 {
        return Err(Error::protocol("oversized chunk header"));
      }
    }
    let text = std::str::from_utf8(&size_line)
      .map_err(|_| Error::protocol("invalid chunk header"))?;
    let size = usize::from_str_radix(text.split(';').next().unwrap_or("").trim(), 16)
      .map_err(|_| Error::protocol("invalid chunk size"))?;
    if size == 0 {
      // Trailer-free termination: consume the final CRLF.
      let mut crlf = [0u8; 2];
      stream.read_exact(&mut crlf).await?;
      return Ok(body);
    }
    if body.len() as u64 + size as u64 > max_body {
      return Err(Error::PayloadTooLarge(body.len() as u64 + size as u64));
    }
    let mut chunk = vec![0u8; size];
    stream.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
  }
}

/// Decode one request from the stream. Returns `Ok(None)` when the client
/// closed the connection between requests.
pub(crate) async fn read_request<S>(
  stream: &mut S,
  limits: &ReadLimits,
  arena: &BufferArena,
) -> Result<Option<Request>>
where
  S: AsyncRead + Unpin,
{
  let Some(head) = read_head(stream, limits.max_head).await? else {
    return Ok(None);
  };
  let (method, target, version, headers) = parse_head(&head)?;
  let uri: Uri = target
    .parse()
    .map_err(|_| Error::protocol(format!("invalid request target: {}", target)))?;
  let mut body = Vec::new();
  if method != Method::CONNECT {
    let content_length = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<u64>().ok());
    let chunked = headers
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    if let Some(length) = content_length {
      if length > limits.max_body {
        return Err(Error::PayloadTooLarge(length));
      }
      body = read_exact_body(stream, length as usize, arena).await?;
    } else if chunked {
      body = read_chunked_body(stream, limits.max_body).await?;
    }
  }
  let mut raw = head;
  raw.extend_from_slice(&body);
  Ok(Some(Request {
    uri,
    version,
    method,
    headers,
    body: if body.is_empty() {
      None
    } else {
      Some(Body::from(body))
    },
    raw: Bytes::from(raw),
  }))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn decodes_request_with_body() {
    let wire = b"POST /submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
    let mut cursor = std::io::Cursor::new(wire.to_vec());
    let arena = BufferArena::new();
    let request = read_request(&mut cursor, &ReadLimits::default(), &arena)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().path(), "/submit");
    assert_eq!(request.uri().query(), Some("x=1"));
    assert_eq!(request.body().unwrap().as_ref(), b"hello");
    assert_eq!(request.raw().as_ref(), wire);
  }

  #[tokio::test]
  async fn clean_close_yields_none() {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let arena = BufferArena::new();
    let request = read_request(&mut cursor, &ReadLimits::default(), &arena)
      .await
      .unwrap();
    assert!(request.is_none());
  }

  #[tokio::test]
  async fn oversize_body_fails_fast() {
    let wire = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 999\r\n\r\n";
    let mut cursor = std::io::Cursor::new(wire.to_vec());
    let arena = BufferArena::new();
    let limits = ReadLimits {
      max_head: 64 * 1024,
      max_body: 100,
    };
    let err = read_request(&mut cursor, &limits, &arena).await.unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge(999)));
  }

  #[tokio::test]
  async fn decodes_chunked_body() {
    let wire = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut cursor = std::io::Cursor::new(wire.to_vec());
    let arena = BufferArena::new();
    let request = read_request(&mut cursor, &ReadLimits::default(), &arena)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(request.body().unwrap().as_ref(), b"hello world");
  }

  #[test]
  fn websocket_upgrade_detection() {
    let request: Request = http::Request::builder()
      .method("GET")
      .uri("http://example.com/ws")
      .header("Connection", "keep-alive, Upgrade")
      .header("Upgrade", "websocket")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert!(request.is_websocket_upgrade());
    let plain: Request = http::Request::builder()
      .uri("http://example.com/")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert!(!plain.is_websocket_upgrade());
  }

  #[test]
  fn serialise_parse_round_trip() {
    let request: Request = http::Request::builder()
      .method("GET")
      .uri("http://example.com/a/b?q=1")
      .header("Accept", "text/html")
      .body(Bytes::new())
      .unwrap()
      .into();
    let raw = request.to_raw();
    let text = String::from_utf8(raw.to_vec()).unwrap();
    assert!(text.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
    assert!(text.contains("host: example.com\r\n") || text.contains("Host: example.com\r\n"));
    assert!(text.contains("accept: text/html\r\n"));
  }

  #[test]
  fn host_port_fallbacks() {
    let request: Request = http::Request::builder()
      .uri("/index.html")
      .header("Host", "example.com:8443")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert_eq!(
      request.host_port(443).unwrap(),
      ("example.com".to_string(), 8443)
    );
    let connect: Request = http::Request::builder()
      .method("CONNECT")
      .uri("example.com:443")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert_eq!(
      connect.host_port(443).unwrap(),
      ("example.com".to_string(), 443)
    );
  }
}
