//! Error types for the proxy engine

use thiserror::Error;

/// A `Result` alias where the `Err` case is `snare::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting traffic.
#[derive(Error, Debug)]
pub enum Error {
  /// Configuration rejected at startup, fatal
  #[error("invalid config: {0}")]
  InvalidConfig(String),
  /// Leaf or root certificate generation failed
  #[error("certificate error: {0}")]
  CertIssue(String),
  /// Client rejected by the blacklist or whitelist
  #[error("access denied: {0}")]
  AccessDenied(String),
  /// Missing or wrong proxy credentials
  #[error("authentication failed: {0}")]
  AuthFailed(String),
  /// Sliding window exhausted for this client
  #[error("rate limited: {0}")]
  RateLimited(String),
  /// Body exceeded the configured cap
  #[error("payload too large: {0} bytes")]
  PayloadTooLarge(u64),
  /// Extension module could not be resolved or constructed
  #[error("handler load failed: {0}")]
  HandlerLoadFailed(String),
  /// A handler panicked during dispatch
  #[error("handler crashed: {0}")]
  HandlerCrash(String),
  /// A synchronous hook exceeded its budget
  #[error("hook timed out: {0}")]
  HookTimeout(String),
  /// Could not connect to the origin
  #[error("upstream unreachable: {0}")]
  UpstreamUnreachable(String),
  /// The origin did not answer within the upstream budget
  #[error("upstream timeout")]
  UpstreamTimeout,
  /// TLS terminate or originate failed
  #[error("tls handshake failed: {0}")]
  TlsHandshakeFailed(String),
  /// Malformed HTTP on the wire
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),
  /// The exchange was cancelled by shutdown
  #[error("cancelled")]
  Cancelled,
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
}

impl Error {
  /// Create a certificate error and log it
  pub fn cert_issue(msg: impl Into<String>) -> Self {
    let error = Error::CertIssue(msg.into());
    tracing::error!("[cert] {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshakeFailed(msg.into());
    tracing::error!("[tls] {}", error);
    error
  }

  /// Create a protocol violation error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::ProtocolViolation(msg.into());
    tracing::debug!("[proxy] {}", error);
    error
  }

  /// Whether the exchange may continue with a best-effort default.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      Error::CertIssue(_) | Error::HandlerCrash(_) | Error::HookTimeout(_)
    )
  }

  /// HTTP status written to the client when this error terminates an exchange.
  pub fn status_code(&self) -> http::StatusCode {
    match self {
      Error::AccessDenied(_) | Error::AuthFailed(_) | Error::RateLimited(_) => {
        http::StatusCode::FORBIDDEN
      }
      Error::PayloadTooLarge(_) => http::StatusCode::PAYLOAD_TOO_LARGE,
      Error::UpstreamTimeout => http::StatusCode::GATEWAY_TIMEOUT,
      Error::UpstreamUnreachable(_) | Error::TlsHandshakeFailed(_) | Error::Io(_) => {
        http::StatusCode::BAD_GATEWAY
      }
      Error::ProtocolViolation(_) | Error::Http(_) => http::StatusCode::BAD_REQUEST,
      _ => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_mapping() {
    assert_eq!(
      Error::RateLimited("10.0.0.1".into()).status_code(),
      http::StatusCode::FORBIDDEN
    );
    assert_eq!(
      Error::PayloadTooLarge(11 << 20).status_code(),
      http::StatusCode::PAYLOAD_TOO_LARGE
    );
    assert_eq!(
      Error::UpstreamTimeout.status_code(),
      http::StatusCode::GATEWAY_TIMEOUT
    );
    assert_eq!(
      Error::UpstreamUnreachable("connection refused".into()).status_code(),
      http::StatusCode::BAD_GATEWAY
    );
  }
}
