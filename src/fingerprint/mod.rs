//! Technology fingerprinting of intercepted responses
//!
//! Rules come from a JSON database; matching runs through a three-tier
//! layered index so the common case never touches a regex.

mod index;

use crate::cache::{CacheStats, TtlCache};
use crate::errors::{Error, Result};
use crate::response::Response;
use base64::prelude::*;
use index::LayeredIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub use index::IndexStats;

/// How a rule's keywords are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
  /// Every keyword must appear as a substring
  Keyword,
  /// Keywords are favicon hash values
  #[serde(rename = "faviconhash")]
  FaviconHash,
  /// Keywords are regular expressions that must all match
  #[serde(alias = "regula")]
  Regex,
}

/// Which part of the response a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLocation {
  /// Response body
  Body,
  /// Response headers, matched as `name:value` lines
  Header,
  /// HTML title
  Title,
}

impl Default for MatchLocation {
  fn default() -> Self {
    MatchLocation::Body
  }
}

/// One fingerprint rule. All keywords must match (AND semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRule {
  /// Technology reported on match
  pub cms: String,
  /// Keyword interpretation
  pub method: MatchMethod,
  /// Inspected location
  #[serde(default)]
  pub location: MatchLocation,
  /// Keywords, patterns or hashes depending on `method`
  #[serde(rename = "keyword", default)]
  pub keywords: Vec<String>,
  #[serde(skip)]
  pub(crate) compiled: Vec<regex::Regex>,
}

#[derive(Debug, Deserialize)]
struct FingerprintDb {
  fingerprint: Vec<FingerprintRule>,
}

/// The response view the engine matches against.
#[derive(Debug, Clone, Default)]
pub struct HttpSample {
  /// Request URL
  pub url: String,
  /// Response status
  pub status: u16,
  /// Lowercased header names to first values
  pub headers: BTreeMap<String, String>,
  /// Decoded body
  pub body: String,
  /// HTML title extracted from the body
  pub title: String,
}

impl HttpSample {
  /// Build a sample from a processed response.
  pub fn from_response(url: impl Into<String>, response: &Response) -> Self {
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|s| (k.as_str().to_ascii_lowercase(), s.to_string()))
      })
      .collect();
    let body = response.text();
    let title = extract_title(&body);
    Self {
      url: url.into(),
      status: response.status_code().as_u16(),
      headers,
      body,
      title,
    }
  }

  pub(crate) fn headers_as_lines(&self) -> String {
    self
      .headers
      .iter()
      .map(|(k, v)| format!("{}:{}", k, v))
      .collect::<Vec<_>>()
      .join("\n")
  }
}

/// Identification outcome for one response.
#[derive(Debug, Clone, Serialize)]
pub struct FingerprintResult {
  /// Request URL
  pub url: String,
  /// Unique matched technology names
  pub matched: Vec<String>,
  /// `min(1, 0.5 + 0.1 * matches)`, `0.0` when nothing matched
  pub confidence: f64,
  /// Matching time
  pub elapsed: Duration,
}

/// Tuning knobs for [`FingerprintEngine`].
#[derive(Debug, Clone)]
pub struct FingerprintOptions {
  /// Result cache capacity
  pub cache_size: usize,
  /// Result cache TTL
  pub cache_ttl: Duration,
  /// Stop collecting once this many unique rules matched
  pub max_matches: usize,
}

impl Default for FingerprintOptions {
  fn default() -> Self {
    Self {
      cache_size: 1000,
      cache_ttl: Duration::from_secs(30 * 60),
      max_matches: 10,
    }
  }
}

/// The rule database, its layered index and the result cache. Immutable once
/// loaded, so the hot path takes no locks.
pub struct FingerprintEngine {
  rules: Vec<Arc<FingerprintRule>>,
  index: LayeredIndex,
  cache: TtlCache<String, Vec<String>>,
  max_matches: usize,
}

impl FingerprintEngine {
  /// Parse a database document (`{"fingerprint": [...]}`) and build the
  /// layered index. Rules with unparseable regexes are dropped with a
  /// warning, matching the reference databases in the wild.
  pub fn from_json(data: &str, options: FingerprintOptions) -> Result<Self> {
    let db: FingerprintDb = serde_json::from_str(data)
      .map_err(|e| Error::InvalidConfig(format!("fingerprint database: {}", e)))?;
    let mut rules = Vec::with_capacity(db.fingerprint.len());
    for mut rule in db.fingerprint {
      if rule.method == MatchMethod::Regex {
        let mut compiled = Vec::with_capacity(rule.keywords.len());
        let mut broken = false;
        for pattern in &rule.keywords {
          match regex::Regex::new(pattern) {
            Ok(re) => compiled.push(re),
            Err(e) => {
              tracing::warn!("[fingerprint] dropping rule {}: bad regex {}: {}", rule.cms, pattern, e);
              broken = true;
              break;
            }
          }
        }
        if broken {
          continue;
        }
        rule.compiled = compiled;
      }
      rules.push(Arc::new(rule));
    }
    let index = LayeredIndex::build(&rules);
    tracing::info!("[fingerprint] loaded {} rules", rules.len());
    Ok(Self {
      rules,
      index,
      cache: TtlCache::new(options.cache_size, options.cache_ttl),
      max_matches: options.max_matches,
    })
  }

  /// Load a database document from disk.
  pub async fn from_file(path: impl AsRef<Path>, options: FingerprintOptions) -> Result<Self> {
    let data = tokio::fs::read_to_string(path.as_ref()).await?;
    Self::from_json(&data, options)
  }

  /// Identify the technologies behind one response.
  pub fn identify(&self, sample: &HttpSample) -> FingerprintResult {
    let start = Instant::now();
    let key = cache_key(sample);
    if let Some(matched) = self.cache.get(&key) {
      return FingerprintResult {
        url: sample.url.clone(),
        matched,
        confidence: 1.0,
        elapsed: start.elapsed(),
      };
    }
    let rules = self.index.search(sample, self.max_matches);
    let mut matched = Vec::new();
    for rule in rules {
      if !matched.contains(&rule.cms) {
        matched.push(rule.cms.clone());
      }
    }
    self.cache.put(key, matched.clone());
    let confidence = confidence_for(matched.len());
    FingerprintResult {
      url: sample.url.clone(),
      matched,
      confidence,
      elapsed: start.elapsed(),
    }
  }

  /// Number of loaded rules.
  pub fn rule_count(&self) -> usize {
    self.rules.len()
  }

  /// Rule counts per method.
  pub fn rule_breakdown(&self) -> BTreeMap<String, usize> {
    let mut breakdown = BTreeMap::new();
    for rule in &self.rules {
      let key = match rule.method {
        MatchMethod::Keyword => "keyword",
        MatchMethod::FaviconHash => "faviconhash",
        MatchMethod::Regex => "regex",
      };
      *breakdown.entry(key.to_string()).or_insert(0) += 1;
    }
    breakdown
  }

  /// Result cache counters.
  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  /// Layered index sizes.
  pub fn index_stats(&self) -> IndexStats {
    self.index.stats()
  }

  /// Spawn the result cache scavenger.
  pub fn spawn_scavenger(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
    self.cache.spawn_scavenger(interval)
  }
}

fn confidence_for(matches: usize) -> f64 {
  if matches == 0 {
    0.0
  } else {
    (0.5 + matches as f64 * 0.1).min(1.0)
  }
}

fn cache_key(sample: &HttpSample) -> String {
  let mut content =
    String::with_capacity(sample.body.len() + sample.title.len() + 64);
  content.push_str(&sample.body);
  content.push_str(&sample.title);
  content.push_str(&sample.headers_as_lines());
  format!("{:x}", md5::compute(content.as_bytes()))
}

/// Extract the HTML `<title>` text, empty when absent.
pub fn extract_title(body: &str) -> String {
  static TITLE: OnceLock<regex::Regex> = OnceLock::new();
  let re = TITLE.get_or_init(|| {
    regex::Regex::new(r"(?i)<title[^>]*>([^<]*)</title>").expect("title regex")
  });
  re.captures(body)
    .and_then(|captures| captures.get(1))
    .map(|m| m.as_str().trim().to_string())
    .unwrap_or_default()
}

static FAVICON_LINKS: OnceLock<Vec<regex::Regex>> = OnceLock::new();

/// Find the favicon URL referenced by an HTML body, falling back to
/// `/favicon.ico` on the request host.
pub fn find_favicon_url(body: &str, base_url: &str) -> String {
  let patterns = FAVICON_LINKS.get_or_init(|| {
    [
      r#"<link[^>]*rel=["']shortcut icon["'][^>]*href=["']([^"']+)["']"#,
      r#"<link[^>]*rel=["']icon["'][^>]*href=["']([^"']+)["']"#,
      r#"<link[^>]*href=["']([^"']+)["'][^>]*rel=["']shortcut icon["']"#,
      r#"<link[^>]*href=["']([^"']+)["'][^>]*rel=["']icon["']"#,
    ]
    .iter()
    .filter_map(|p| regex::Regex::new(p).ok())
    .collect()
  });
  for pattern in patterns {
    if let Some(captures) = pattern.captures(body) {
      if let Some(href) = captures.get(1) {
        return resolve_url(base_url, href.as_str());
      }
    }
  }
  resolve_url(base_url, "/favicon.ico")
}

fn resolve_url(base_url: &str, relative: &str) -> String {
  if relative.starts_with("http") {
    return relative.to_string();
  }
  if let Some(rest) = relative.strip_prefix("//") {
    return format!("http://{}", rest);
  }
  if relative.starts_with('/') {
    if let Some((protocol, remainder)) = base_url.split_once("://") {
      let domain = remainder.split('/').next().unwrap_or_default();
      return format!("{}://{}{}", protocol, domain, relative);
    }
    return format!("{}{}", base_url, relative);
  }
  format!("{}/{}", base_url, relative)
}

/// Hash favicon bytes into the decimal token rule databases carry:
/// md5, base64, then a positional fold.
pub fn favicon_hash(data: &[u8]) -> String {
  let digest = md5::compute(data);
  let encoded = BASE64_STANDARD.encode(digest.0);
  let mut sum: i32 = 0;
  for (index, ch) in encoded.chars().enumerate() {
    sum = sum.wrapping_add(ch as i32 * (index as i32 + 1));
  }
  sum.to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  const DB: &str = r#"{
    "fingerprint": [
      {"cms": "WordPress", "method": "keyword", "location": "body", "keyword": ["wp-content", "wp-includes"]},
      {"cms": "nginx", "method": "keyword", "location": "header", "keyword": ["server:nginx"]},
      {"cms": "GitLab", "method": "keyword", "location": "title", "keyword": ["gitlab"]},
      {"cms": "phpMyAdmin", "method": "keyword", "location": "body", "keyword": ["/phpmyadmin/"]},
      {"cms": "Grafana", "method": "regula", "location": "body", "keyword": ["grafana-app", "window\\.grafana"]}
    ]
  }"#;

  fn engine() -> FingerprintEngine {
    FingerprintEngine::from_json(DB, FingerprintOptions::default()).unwrap()
  }

  fn sample(body: &str) -> HttpSample {
    HttpSample {
      url: "http://example.com/".to_string(),
      status: 200,
      headers: BTreeMap::new(),
      body: body.to_string(),
      title: extract_title(body),
    }
  }

  #[test]
  fn keyword_and_semantics() {
    let engine = engine();
    let partial = engine.identify(&sample("assets under wp-content only"));
    assert!(partial.matched.is_empty());
    assert_eq!(partial.confidence, 0.0);

    let full = engine.identify(&sample("wp-content and wp-includes present"));
    assert_eq!(full.matched, vec!["WordPress".to_string()]);
    assert!((full.confidence - 0.6).abs() < f64::EPSILON);
  }

  #[test]
  fn header_rules_match_name_value_tokens() {
    let engine = engine();
    let mut s = sample("plain body");
    s.headers
      .insert("server".to_string(), "nginx/1.25.3".to_string());
    let result = engine.identify(&s);
    assert_eq!(result.matched, vec!["nginx".to_string()]);
  }

  #[test]
  fn title_rules_match_extracted_title() {
    let engine = engine();
    let result = engine.identify(&sample(
      "<html><head><title>Sign in - GitLab</title></head></html>",
    ));
    assert_eq!(result.matched, vec!["GitLab".to_string()]);
  }

  #[test]
  fn path_keywords_hit_from_the_url() {
    let engine = engine();
    let mut s = sample("nothing in the body");
    s.url = "http://example.com/phpMyAdmin/index.php".to_string();
    // The path index keys on keywords containing '/' and verifies against
    // the rule location, which is the body here.
    s.body = "redirecting to /phpMyAdmin/ setup".to_string();
    let result = engine.identify(&s);
    assert_eq!(result.matched, vec!["phpMyAdmin".to_string()]);
  }

  #[test]
  fn regula_alias_compiles_and_matches() {
    let engine = engine();
    let result = engine.identify(&sample(
      "<script src=\"grafana-app.js\"></script><script>window.grafana = {};</script>",
    ));
    assert_eq!(result.matched, vec!["Grafana".to_string()]);
  }

  #[test]
  fn cache_hit_reports_full_confidence() {
    let engine = engine();
    let s = sample("wp-content wp-includes");
    let first = engine.identify(&s);
    assert!((first.confidence - 0.6).abs() < f64::EPSILON);
    let second = engine.identify(&s);
    assert_eq!(second.matched, first.matched);
    assert_eq!(second.confidence, 1.0);
    assert_eq!(engine.cache_stats().hits, 1);
  }

  #[test]
  fn title_extraction() {
    assert_eq!(
      extract_title("<html><title> Hello World </title></html>"),
      "Hello World"
    );
    assert_eq!(extract_title("<html><body>untitled</body></html>"), "");
  }

  #[test]
  fn favicon_hash_is_stable() {
    let a = favicon_hash(b"fake favicon bytes");
    let b = favicon_hash(b"fake favicon bytes");
    let c = favicon_hash(b"other bytes");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.parse::<i64>().is_ok());
  }

  #[test]
  fn favicon_url_discovery() {
    let body = r#"<link rel="shortcut icon" href="/static/favicon.ico">"#;
    assert_eq!(
      find_favicon_url(body, "https://example.com/app"),
      "https://example.com/static/favicon.ico"
    );
    assert_eq!(
      find_favicon_url("no links here", "https://example.com"),
      "https://example.com/favicon.ico"
    );
  }
}
