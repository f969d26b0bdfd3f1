use crate::arena::BufferArena;
use crate::body::Body;
use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use http::{Method, StatusCode, Version};
use std::fmt::{Debug, Formatter};
use std::io::Read;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// An origin response travelling back through the interception pipeline.
#[derive(Clone, Default)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status_code", &self.status_code)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<http::Response<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: http::Response<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// An HTTP response builder.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// The status code.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }

  /// Mutable access to the status code.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut StatusCode {
    &mut self.status_code
  }

  /// The HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The response headers.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }

  /// Mutable access to the response headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }

  /// The response body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Mutable access to the response body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }

  /// The advertised `Content-Length`, when parseable.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }

  /// Body decoded as UTF-8, lossily.
  pub fn text(&self) -> String {
    match self.body() {
      Some(body) => String::from_utf8_lossy(body).to_string(),
      None => String::new(),
    }
  }

  /// Whether a body is permitted for this status at all.
  pub(crate) fn allows_body(&self) -> bool {
    let code = self.status_code.as_u16();
    !(100..200).contains(&code) && code != 204 && code != 304
  }

  /// Serialise status line, headers and body for the client socket. The
  /// engine re-frames bodies with `Content-Length` after hop-by-hop
  /// stripping, so `Transfer-Encoding` never reappears here.
  pub fn to_raw(&self) -> Bytes {
    let mut wire = Vec::new();
    wire.extend(format!("{:?}", self.version).as_bytes());
    wire.extend(SPACE);
    wire.extend(self.status_code.as_str().as_bytes());
    if let Some(reason) = self.status_code.canonical_reason() {
      wire.extend(SPACE);
      wire.extend(reason.as_bytes());
    }
    wire.extend(CR_LF);
    for (k, v) in self.headers.iter() {
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

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, part) in buffer.splitn(2, |b| *b == b':').enumerate() {
    let part = part.strip_prefix(b" ").unwrap_or(part);
    match index {
      0 => match http::HeaderName::from_bytes(part) {
        Ok(name) => k = Some(name),
        Err(err) => return Err(Error::Http(http::Error::from(err))),
      },
      1 => match http::HeaderValue::from_bytes(part) {
        Ok(value) => v = Some(value),
        Err(err) => return Err(Error::Http(http::Error::from(err))),
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// Decoding rules for one upstream response.
#[derive(Clone)]
pub(crate) struct ResponseConfig {
  pub method: Method,
  pub max_body: u64,
  pub arena: BufferArena,
}

/// Reads a response off an origin socket: status line, headers, body
/// (length-delimited, chunked or close-delimited), then transparent gzip
/// decode. Decoded bodies lose their `Content-Encoding` and
/// `Content-Length`; the engine re-frames before serialising.
pub(crate) struct ResponseBuilder<T: AsyncRead + Unpin> {
  reader: BufReader<T>,
  config: ResponseConfig,
}

/// Facts about how the origin framed the response, used to decide whether
/// the socket can return to the pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResponseFraming {
  pub explicit: bool,
}

impl<T: AsyncRead + Unpin> ResponseBuilder<T> {
  pub fn new(reader: BufReader<T>, config: ResponseConfig) -> Self {
    Self { reader, config }
  }

  async fn parse_status_line(&mut self) -> Result<(Version, StatusCode)> {
    let mut line = Vec::new();
    let n = self.reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::protocol("origin closed before status line"));
    }
    let line = line.strip_suffix(b"\r\n").unwrap_or(&line);
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let mut parts = line.splitn(3, |b| *b == b' ');
    let version = match parts.next() {
      Some(b"HTTP/0.9") => Version::HTTP_09,
      Some(b"HTTP/1.0") => Version::HTTP_10,
      Some(b"HTTP/1.1") => Version::HTTP_11,
      _ => return Err(Error::protocol("invalid status line version")),
    };
    let status = parts
      .next()
      .and_then(|code| StatusCode::from_bytes(code).ok())
      .ok_or_else(|| Error::protocol("invalid status code"))?;
    Ok((version, status))
  }

  async fn read_headers(&mut self) -> Result<http::HeaderMap> {
    let mut headers = http::HeaderMap::new();
    let mut line = Vec::new();
    loop {
      line.clear();
      let n = self.reader.read_until(b'\n', &mut line).await?;
      if n == 0 || line == b"\r\n" || line == b"\n" {
        break;
      }
      if let Ok((Some(k), Some(v))) = parser_headers(&line) {
        if headers.contains_key(&k) {
          headers.append(k, v);
        } else {
          headers.insert(k, v);
        }
      }
    }
    Ok(headers)
  }

  async fn read_body(&mut self, headers: &mut http::HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if matches!(self.config.method, Method::HEAD) {
      return Ok(body);
    }
    let content_length: Option<u64> = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok());
    if let Some(length) = content_length {
      if length > self.config.max_body {
        return Err(Error::PayloadTooLarge(length));
      }
    }
    let chunked = headers
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    if chunked {
      body = self.read_chunked_body().await?;
    } else if let Some(length) = content_length {
      body = vec![0u8; length as usize];
      self.reader.read_exact(&mut body).await?;
    } else {
      // Close-delimited body.
      let mut scratch = self.config.arena.acquire(8 * 1024);
      loop {
        let n = self.reader.read(&mut scratch[..]).await?;
        if n == 0 {
          break;
        }
        body.extend_from_slice(&scratch[..n]);
        if body.len() as u64 > self.config.max_body {
          return Err(Error::PayloadTooLarge(body.len() as u64));
        }
      }
    }
    if let Some(encoding) = headers.get(http::header::CONTENT_ENCODING) {
      if encoding
        .to_str()
        .map(|e| e.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
      {
        let mut decoded = Vec::new();
        let mut decoder = MultiGzDecoder::new(&body[..]);
        decoder
          .read_to_end(&mut decoded)
          .map_err(|e| Error::protocol(format!("gzip decode failed: {}", e)))?;
        if decoded.len() as u64 > self.config.max_body {
          return Err(Error::PayloadTooLarge(decoded.len() as u64));
        }
        body = decoded;
        headers.remove(http::header::CONTENT_ENCODING);
        headers.remove(http::header::CONTENT_LENGTH);
      }
    }
    Ok(body)
  }

  async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
      let mut size_line = Vec::new();
      self.reader.read_until(b'\n', &mut size_line).await?;
      let text = std::str::from_utf8(&size_line)
        .map_err(|_| Error::protocol("invalid chunk header"))?
        .trim();
      if text.is_empty() {
        continue;
      }
      let size = usize::from_str_radix(text.split(';').next().unwrap_or(""), 16)
        .map_err(|_| Error::protocol("invalid chunk size"))?;
      if size == 0 {
        let mut crlf = Vec::new();
        let _ = self.reader.read_until(b'\n', &mut crlf).await?;
        return Ok(body);
      }
      if body.len() as u64 + size as u64 > self.config.max_body {
        return Err(Error::PayloadTooLarge(body.len() as u64 + size as u64));
      }
      let mut chunk = vec![0u8; size];
      self.reader.read_exact(&mut chunk).await?;
      body.append(&mut chunk);
      let mut crlf = Vec::new();
      let _ = self.reader.read_until(b'\n', &mut crlf).await?;
    }
  }

  /// Decode the full response, returning it with the underlying stream and
  /// the observed framing.
  pub async fn build(mut self) -> Result<(Response, T, ResponseFraming)> {
    let (version, status_code) = self.parse_status_line().await?;
    let mut headers = self.read_headers().await?;
    let explicit = headers.contains_key(http::header::CONTENT_LENGTH)
      || headers.contains_key(http::header::TRANSFER_ENCODING)
      || !status_allows_body(status_code);
    let body = if status_allows_body(status_code) {
      self.read_body(&mut headers).await?
    } else {
      Vec::new()
    };
    let response = Response {
      version,
      status_code,
      headers,
      body: if body.is_empty() {
        None
      } else {
        Some(Body::from(body))
      },
    };
    let stream = self.reader.into_inner();
    Ok((response, stream, ResponseFraming { explicit }))
  }
}

fn status_allows_body(status: StatusCode) -> bool {
  let code = status.as_u16();
  !(100..200).contains(&code) && code != 204 && code != 304
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn decode(wire: &[u8]) -> Response {
    let cursor = std::io::Cursor::new(wire.to_vec());
    let builder = ResponseBuilder::new(
      BufReader::new(cursor),
      ResponseConfig {
        method: Method::GET,
        max_body: 1024 * 1024,
        arena: BufferArena::new(),
      },
    );
    builder.build().await.unwrap().0
  }

  #[tokio::test]
  async fn decodes_content_length_body() {
    let response =
      decode(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: nginx\r\n\r\nhello").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.headers().get("server").unwrap(), "nginx");
    assert_eq!(response.text(), "hello");
  }

  #[tokio::test]
  async fn decodes_chunked_body() {
    let response = decode(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )
    .await;
    assert_eq!(response.text(), "wikipedia");
  }

  #[tokio::test]
  async fn decodes_gzip_body_and_drops_encoding() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed payload").unwrap();
    let gz = encoder.finish().unwrap();
    let mut wire = format!(
      "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      gz.len()
    )
    .into_bytes();
    wire.extend_from_slice(&gz);
    let response = decode(&wire).await;
    assert_eq!(response.text(), "compressed payload");
    assert!(response.headers().get(http::header::CONTENT_ENCODING).is_none());
  }

  #[tokio::test]
  async fn oversize_declared_body_fails() {
    let cursor = std::io::Cursor::new(
      b"HTTP/1.1 200 OK\r\nContent-Length: 2048\r\n\r\n".to_vec(),
    );
    let builder = ResponseBuilder::new(
      BufReader::new(cursor),
      ResponseConfig {
        method: Method::GET,
        max_body: 1024,
        arena: BufferArena::new(),
      },
    );
    assert!(matches!(
      builder.build().await,
      Err(Error::PayloadTooLarge(2048))
    ));
  }

  #[test]
  fn serialises_status_and_headers() {
    let response: Response = http::Response::builder()
      .status(404)
      .header("Content-Length", "9")
      .body("not found".to_string())
      .unwrap()
      .into();
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(raw.ends_with("\r\n\r\nnot found"));
  }
}
