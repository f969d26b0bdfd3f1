//! Certificate authority and leaf management
//!
//! The root is generated once and persisted under the certificate directory;
//! every intercepted host gets a short-lived leaf signed by it, cached per
//! hostname.

use crate::cache::{CacheStats, TtlCache};
use crate::errors::{Error, Result};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

const CA_KEY_FILE: &str = "ca-key.pem";
const CA_CERT_FILE: &str = "ca-cert.pem";
/// Leaf validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root validity in days (10 years)
const ROOT_TTL_DAYS: i64 = 3650;
/// Offset for not_before to absorb clock skew
const NOT_BEFORE_OFFSET: i64 = 60;

/// The self-signed root and its signing key.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  cert_dir: PathBuf,
}

/// A minted leaf plus the ready-to-serve TLS configuration built from it.
pub struct LeafCert {
  /// Leaf followed by the root
  pub chain: Vec<CertificateDer<'static>>,
  /// Leaf private key
  pub key: PrivateKeyDer<'static>,
  /// Expiry of the leaf certificate
  pub not_after: OffsetDateTime,
  /// Server configuration advertising `h2` and `http/1.1`
  pub server_config: Arc<ServerConfig>,
}

impl CertificateAuthority {
  /// Load the root from `cert_dir`, generating and persisting a fresh one
  /// when the directory holds none.
  pub async fn load_or_generate(cert_dir: impl AsRef<Path>) -> Result<Self> {
    let cert_dir = cert_dir.as_ref().to_path_buf();
    if !cert_dir.exists() {
      fs::create_dir_all(&cert_dir).await?;
    }
    let key_path = cert_dir.join(CA_KEY_FILE);
    let cert_path = cert_dir.join(CA_CERT_FILE);
    let (issuer, ca_cert_der, ca_cert_pem) = if key_path.exists() && cert_path.exists() {
      Self::load(&key_path, &cert_path).await?
    } else {
      tracing::info!("[cert] no root found, generating a new CA in {:?}", cert_dir);
      Self::generate(&key_path, &cert_path).await?
    };
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      cert_dir,
    })
  }

  async fn load(
    key_path: &Path,
    cert_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;
    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::cert_issue(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_issue(format!("failed to load CA certificate: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::cert_issue("no certificate in CA PEM"))?
      .map_err(|e| Error::cert_issue(format!("failed to decode CA PEM: {}", e)))?;
    tracing::info!("[cert] root CA loaded from disk");
    Ok((issuer, cert_der, cert_pem))
  }

  async fn generate(
    key_path: &Path,
    cert_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Snare Root CA");
    dn.push(DnType::OrganizationName, "Snare");
    dn.push(DnType::OrganizationalUnitName, "Snare Root CA");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::cert_issue(format!("failed to generate CA key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::cert_issue(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;
    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).await?;
      fs::set_permissions(cert_path, std::fs::Permissions::from_mode(0o644)).await?;
    }

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_issue(format!("failed to build issuer: {}", e)))?;
    tracing::info!("[cert] new root CA written to {:?}", cert_path);
    Ok((issuer, cert_der, cert_pem))
  }

  /// Mint a leaf for `host`, signed by this root.
  pub fn mint_leaf(&self, host: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();
    // Nanosecond serials keep concurrently minted leaves distinct.
    params.serial_number = Some((OffsetDateTime::now_utc().unix_timestamp_nanos() as u64).into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::cert_issue(format!("invalid hostname: {}", host))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::seconds(NOT_BEFORE_OFFSET);
    let not_after = now + time::Duration::seconds(LEAF_TTL_SECS);
    params.not_after = not_after;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::cert_issue(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::cert_issue(format!("failed to sign leaf for {}: {}", host, e)))?;
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::cert_issue("failed to serialise leaf key"))?;
    let chain = vec![cert_der, self.ca_cert_der.clone()];
    let mut server_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain.clone(), key.clone_key())
      .map_err(|e| Error::cert_issue(format!("failed to build server config: {}", e)))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    tracing::debug!("[cert] minted leaf for {}", host);
    Ok(LeafCert {
      chain,
      key,
      not_after,
      server_config: Arc::new(server_config),
    })
  }

  /// Root certificate in PEM form for trust-store installation.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.cert_dir.join(CA_CERT_FILE)
  }

  /// Copy the root certificate to `path` for distribution.
  pub async fn export_ca_cert(&self, path: impl AsRef<Path>) -> Result<()> {
    fs::write(path.as_ref(), self.ca_cert_pem.as_bytes()).await?;
    tracing::info!("[cert] root certificate exported to {:?}", path.as_ref());
    Ok(())
  }
}

/// Options for [`CertManager`].
#[derive(Debug, Clone)]
pub struct CertOptions {
  /// Directory holding (or receiving) the root material
  pub cert_dir: PathBuf,
  /// Cache minted leaves per host
  pub enable_cache: bool,
  /// Leaf cache TTL
  pub cache_ttl: Duration,
  /// Leaf cache capacity
  pub cache_capacity: usize,
}

impl Default for CertOptions {
  fn default() -> Self {
    Self {
      cert_dir: PathBuf::from("./certs"),
      enable_cache: true,
      cache_ttl: Duration::from_secs(24 * 60 * 60),
      cache_capacity: 1000,
    }
  }
}

/// Root CA plus the per-host leaf cache.
pub struct CertManager {
  ca: CertificateAuthority,
  cache: Option<TtlCache<String, Arc<LeafCert>>>,
}

impl CertManager {
  /// Initialise the CA from `options`, loading or generating the root.
  pub async fn new(options: CertOptions) -> Result<Self> {
    let ca = CertificateAuthority::load_or_generate(&options.cert_dir).await?;
    let cache = options
      .enable_cache
      .then(|| TtlCache::new(options.cache_capacity, options.cache_ttl));
    Ok(Self { ca, cache })
  }

  /// Leaf for `host`, from the cache when fresh, minted otherwise.
  ///
  /// Concurrent misses on one host may both mint; the second insert
  /// overwrites benignly and either leaf validates against the root.
  pub fn get_certificate(&self, host: &str) -> Result<Arc<LeafCert>> {
    if let Some(cache) = &self.cache {
      if let Some(leaf) = cache.get(&host.to_string()) {
        return Ok(leaf);
      }
    }
    let leaf = Arc::new(self.ca.mint_leaf(host)?);
    if let Some(cache) = &self.cache {
      cache.put(host.to_string(), Arc::clone(&leaf));
    }
    Ok(leaf)
  }

  /// The underlying authority.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Root certificate in PEM form.
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// Leaf cache counters, when caching is enabled.
  pub fn cache_stats(&self) -> Option<CacheStats> {
    self.cache.as_ref().map(|c| c.stats())
  }

  /// Spawn the leaf cache scavenger. No-op handle when caching is off.
  pub fn spawn_scavenger(&self, interval: Duration) -> Option<tokio::task::JoinHandle<()>> {
    self.cache.as_ref().map(|c| c.spawn_scavenger(interval))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn leaf_chains_to_root_and_caches() {
    let dir = std::env::temp_dir().join("snare-ca-unit");
    let _ = std::fs::remove_dir_all(&dir);
    let manager = CertManager::new(CertOptions {
      cert_dir: dir.clone(),
      ..Default::default()
    })
    .await
    .unwrap();
    let first = manager.get_certificate("unit.example.com").unwrap();
    assert_eq!(first.chain.len(), 2);
    let second = manager.get_certificate("unit.example.com").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[tokio::test]
  async fn ip_hosts_get_ip_sans() {
    let dir = std::env::temp_dir().join("snare-ca-ip-unit");
    let _ = std::fs::remove_dir_all(&dir);
    let manager = CertManager::new(CertOptions {
      cert_dir: dir.clone(),
      ..Default::default()
    })
    .await
    .unwrap();
    // Minting for an IP literal must not error.
    let leaf = manager.get_certificate("127.0.0.1").unwrap();
    assert!(leaf.not_after > OffsetDateTime::now_utc());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
