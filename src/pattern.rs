//! Rule-scored traffic classification
//!
//! Each exchange is matched against weighted rule sets and classified into a
//! traffic kind (API call, page view, bot, attack, ...). Results are cached
//! by request URL.

use crate::cache::TtlCache;
use crate::errors::{Error, Result};
use crate::pipeline::{ExchangeContext, ResponseHandler};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// The classification a rule set assigns to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
  /// API call
  Api,
  /// Browser page view
  #[serde(rename = "webpage")]
  WebPage,
  /// File download
  Download,
  /// File upload
  Upload,
  /// WebSocket connection
  #[serde(rename = "websocket")]
  WebSocket,
  /// AJAX request
  Ajax,
  /// Crawler or robot
  Bot,
  /// Suspected attack
  Attack,
  /// Static asset
  Static,
  /// Authentication flow
  Auth,
  /// Admin backend
  Admin,
  /// Search request
  Search,
  /// Form submission
  Form,
  /// Redirect response
  Redirect,
  /// Error page
  Error,
  /// Nothing matched
  Unknown,
}

/// Field a sub-rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
  /// HTTP method
  Method,
  /// URL path
  Path,
  /// Query string
  Query,
  /// A header, selected by `name`
  Header,
  /// User-Agent header
  UserAgent,
  /// Content-Type header
  ContentType,
  /// Referer header
  Referer,
  /// Host
  Host,
  /// Request body size
  RequestSize,
  /// Response body size
  ResponseSize,
  /// Response status
  StatusCode,
}

/// Comparison a sub-rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
  /// Case-insensitive equality
  Equals,
  /// Case-insensitive substring
  Contains,
  /// Case-insensitive prefix
  StartsWith,
  /// Case-insensitive suffix
  EndsWith,
  /// Regular expression match
  Regex,
  /// Numeric greater-than
  Gt,
  /// Numeric less-than
  Lt,
  /// Member of a comma-separated list
  In,
  /// Not a member of a comma-separated list
  NotIn,
}

/// One weighted condition inside a [`TrafficPattern`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRule {
  /// Field under inspection
  pub field: RuleField,
  /// Header name when `field` is `Header`
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Comparison operator
  pub operator: RuleOp,
  /// Comparison operand
  pub value: String,
  /// Contribution to the pattern score
  pub weight: f64,
  /// The pattern cannot match unless this sub-rule does
  #[serde(default)]
  pub required: bool,
  #[serde(skip)]
  regex: Option<regex::Regex>,
}

/// A weighted rule set classifying traffic into one [`PatternKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPattern {
  /// Kind assigned on match
  #[serde(rename = "type")]
  pub kind: PatternKind,
  /// Human-readable name
  pub name: String,
  /// What the pattern describes
  #[serde(default)]
  pub description: String,
  /// Weighted conditions
  pub rules: Vec<SubRule>,
  /// Tie-break order, smaller wins
  pub priority: i32,
  /// Scale applied to the matched-weight ratio
  #[serde(rename = "confidence")]
  pub confidence_weight: f64,
  /// Disabled patterns never match
  pub enabled: bool,
}

impl TrafficPattern {
  fn compile(&mut self) -> Result<()> {
    for rule in &mut self.rules {
      if rule.operator == RuleOp::Regex {
        rule.regex = Some(
          regex::Regex::new(&rule.value)
            .map_err(|e| Error::InvalidConfig(format!("pattern regex {}: {}", rule.value, e)))?,
        );
      }
    }
    Ok(())
  }
}

/// Flattened view of one exchange, the matching input.
#[derive(Debug, Clone, Default)]
pub struct TrafficInfo {
  /// HTTP method
  pub method: String,
  /// Absolute URL
  pub url: String,
  /// URL path
  pub path: String,
  /// Query string
  pub query: String,
  /// Lowercased header names to values
  pub headers: BTreeMap<String, String>,
  /// User-Agent header
  pub user_agent: String,
  /// Content-Type header
  pub content_type: String,
  /// Referer header
  pub referer: String,
  /// Target host
  pub host: String,
  /// Request body size
  pub request_size: u64,
  /// Response body size
  pub response_size: u64,
  /// Response status
  pub status_code: u16,
  /// Effective client IP
  pub client_ip: String,
}

impl TrafficInfo {
  /// Extract matching input from a finished exchange.
  pub fn from_exchange(request: &Request, response: &Response, ctx: &ExchangeContext) -> Self {
    let headers: BTreeMap<String, String> = ctx
      .headers_snapshot
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.as_str().to_string(), s.to_string())))
      .collect();
    let header = |name: &str| headers.get(name).cloned().unwrap_or_default();
    TrafficInfo {
      method: ctx.method.to_string(),
      url: ctx.url.clone(),
      path: request.uri().path().to_string(),
      query: request.uri().query().unwrap_or_default().to_string(),
      user_agent: header("user-agent"),
      content_type: header("content-type"),
      referer: header("referer"),
      host: request.uri().host().unwrap_or_default().to_string(),
      request_size: ctx.body_bytes,
      response_size: response.body().map(|b| b.len() as u64).unwrap_or(0),
      status_code: response.status_code().as_u16(),
      client_ip: ctx.client_ip.clone(),
      headers,
    }
  }
}

/// A classification outcome.
#[derive(Debug, Clone)]
pub struct PatternMatch {
  /// Assigned kind, `Unknown` when nothing scored above the threshold
  pub kind: PatternKind,
  /// Name of the winning pattern
  pub name: String,
  /// Score of the winning pattern, 0.0 for `Unknown`
  pub confidence: f64,
}

impl PatternMatch {
  fn unknown() -> Self {
    Self {
      kind: PatternKind::Unknown,
      name: "Unknown".to_string(),
      confidence: 0.0,
    }
  }
}

/// Counters of a [`PatternRecognizer`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecognizerStats {
  /// Exchanges examined
  pub total: u64,
  /// Exchanges classified as something other than `Unknown`
  pub recognized: u64,
  /// Tally per assigned kind
  pub by_kind: HashMap<PatternKind, u64>,
}

/// Classifies exchanges against an ordered set of weighted patterns.
pub struct PatternRecognizer {
  patterns: RwLock<Vec<TrafficPattern>>,
  threshold: f64,
  enabled: AtomicBool,
  cache: TtlCache<String, (PatternKind, f64)>,
  total: AtomicU64,
  recognized: AtomicU64,
  by_kind: Mutex<HashMap<PatternKind, u64>>,
}

impl PatternRecognizer {
  /// Create a recogniser with no patterns.
  pub fn new() -> Self {
    Self {
      patterns: RwLock::new(Vec::new()),
      threshold: 0.6,
      enabled: AtomicBool::new(true),
      cache: TtlCache::new(1000, Duration::from_secs(5 * 60)),
      total: AtomicU64::new(0),
      recognized: AtomicU64::new(0),
      by_kind: Mutex::new(HashMap::new()),
    }
  }

  /// Create a recogniser preloaded with the built-in pattern set.
  pub fn with_default_patterns() -> Self {
    let recognizer = Self::new();
    for pattern in default_patterns() {
      // Built-in regexes are known-good.
      recognizer.add_pattern(pattern).expect("default pattern");
    }
    recognizer
  }

  /// Register a pattern, compiling its regexes.
  pub fn add_pattern(&self, mut pattern: TrafficPattern) -> Result<()> {
    pattern.compile()?;
    self.patterns.write().unwrap().push(pattern);
    Ok(())
  }

  /// Remove every pattern of `kind`.
  pub fn remove_patterns(&self, kind: PatternKind) {
    self.patterns.write().unwrap().retain(|p| p.kind != kind);
  }

  /// Replace the pattern set from a JSON array.
  pub fn load_from_json(&self, data: &str) -> Result<usize> {
    let mut patterns: Vec<TrafficPattern> =
      serde_json::from_str(data).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    for pattern in &mut patterns {
      pattern.compile()?;
    }
    let count = patterns.len();
    *self.patterns.write().unwrap() = patterns;
    self.cache.clear();
    tracing::info!("[pattern] loaded {} traffic patterns", count);
    Ok(count)
  }

  /// Export the pattern set as JSON.
  pub fn export_json(&self) -> Result<String> {
    serde_json::to_string_pretty(&*self.patterns.read().unwrap())
      .map_err(|e| Error::InvalidConfig(e.to_string()))
  }

  /// Turn classification on or off.
  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.store(enabled, Ordering::Relaxed);
  }

  /// Classify one exchange.
  pub fn recognize(&self, info: &TrafficInfo) -> PatternMatch {
    if !self.enabled.load(Ordering::Relaxed) {
      return PatternMatch::unknown();
    }
    self.total.fetch_add(1, Ordering::Relaxed);
    if let Some((kind, confidence)) = self.cache.get(&info.url) {
      self.tally(kind);
      return PatternMatch {
        kind,
        name: format!("{:?}", kind),
        confidence,
      };
    }
    let patterns = self.patterns.read().unwrap();
    let mut best: Option<(&TrafficPattern, f64)> = None;
    for pattern in patterns.iter().filter(|p| p.enabled) {
      let Some(score) = self.score(pattern, info) else {
        continue;
      };
      if score < self.threshold {
        continue;
      }
      best = match best {
        None => Some((pattern, score)),
        Some((current, current_score)) => {
          if score > current_score
            || (score == current_score && pattern.priority < current.priority)
          {
            Some((pattern, score))
          } else {
            Some((current, current_score))
          }
        }
      };
    }
    let result = match best {
      Some((pattern, score)) => PatternMatch {
        kind: pattern.kind,
        name: pattern.name.clone(),
        confidence: score,
      },
      None => PatternMatch::unknown(),
    };
    self.cache.put(info.url.clone(), (result.kind, result.confidence));
    self.tally(result.kind);
    result
  }

  fn tally(&self, kind: PatternKind) {
    if kind != PatternKind::Unknown {
      self.recognized.fetch_add(1, Ordering::Relaxed);
    }
    *self.by_kind.lock().unwrap().entry(kind).or_insert(0) += 1;
  }

  /// `None` when a required sub-rule missed, the weighted score otherwise.
  fn score(&self, pattern: &TrafficPattern, info: &TrafficInfo) -> Option<f64> {
    let mut total_weight = 0.0;
    let mut matched_weight = 0.0;
    for rule in &pattern.rules {
      total_weight += rule.weight;
      if match_rule(rule, info) {
        matched_weight += rule.weight;
      } else if rule.required {
        return None;
      }
    }
    if total_weight <= 0.0 {
      return None;
    }
    Some(matched_weight / total_weight * pattern.confidence_weight)
  }

  /// Counter snapshot.
  pub fn stats(&self) -> RecognizerStats {
    RecognizerStats {
      total: self.total.load(Ordering::Relaxed),
      recognized: self.recognized.load(Ordering::Relaxed),
      by_kind: self.by_kind.lock().unwrap().clone(),
    }
  }
}

impl Default for PatternRecognizer {
  fn default() -> Self {
    Self::with_default_patterns()
  }
}

fn match_rule(rule: &SubRule, info: &TrafficInfo) -> bool {
  let value: Cow<str> = match rule.field {
    RuleField::Method => Cow::Borrowed(info.method.as_str()),
    RuleField::Path => Cow::Borrowed(info.path.as_str()),
    RuleField::Query => Cow::Borrowed(info.query.as_str()),
    RuleField::UserAgent => Cow::Borrowed(info.user_agent.as_str()),
    RuleField::ContentType => Cow::Borrowed(info.content_type.as_str()),
    RuleField::Referer => Cow::Borrowed(info.referer.as_str()),
    RuleField::Host => Cow::Borrowed(info.host.as_str()),
    RuleField::RequestSize => Cow::Owned(info.request_size.to_string()),
    RuleField::ResponseSize => Cow::Owned(info.response_size.to_string()),
    RuleField::StatusCode => Cow::Owned(info.status_code.to_string()),
    RuleField::Header => match &rule.name {
      Some(name) => match info.headers.get(&name.to_ascii_lowercase()) {
        Some(value) => Cow::Borrowed(value.as_str()),
        None => return false,
      },
      None => Cow::Owned(
        info
          .headers
          .iter()
          .map(|(k, v)| format!("{}: {}", k, v))
          .collect::<Vec<_>>()
          .join("\n"),
      ),
    },
  };
  execute_match(rule, &value)
}

fn execute_match(rule: &SubRule, value: &str) -> bool {
  match rule.operator {
    RuleOp::Equals => value.eq_ignore_ascii_case(&rule.value),
    RuleOp::Contains => value
      .to_ascii_lowercase()
      .contains(&rule.value.to_ascii_lowercase()),
    RuleOp::StartsWith => value
      .to_ascii_lowercase()
      .starts_with(&rule.value.to_ascii_lowercase()),
    RuleOp::EndsWith => value
      .to_ascii_lowercase()
      .ends_with(&rule.value.to_ascii_lowercase()),
    RuleOp::Regex => rule
      .regex
      .as_ref()
      .map(|re| re.is_match(value))
      .unwrap_or(false),
    RuleOp::Gt => match (value.parse::<f64>(), rule.value.parse::<f64>()) {
      (Ok(a), Ok(b)) => a > b,
      _ => false,
    },
    RuleOp::Lt => match (value.parse::<f64>(), rule.value.parse::<f64>()) {
      (Ok(a), Ok(b)) => a < b,
      _ => false,
    },
    RuleOp::In => rule
      .value
      .split(',')
      .any(|candidate| candidate.trim().eq_ignore_ascii_case(value)),
    RuleOp::NotIn => !rule
      .value
      .split(',')
      .any(|candidate| candidate.trim().eq_ignore_ascii_case(value)),
  }
}

fn sub_rule(field: RuleField, operator: RuleOp, value: &str, weight: f64) -> SubRule {
  SubRule {
    field,
    name: None,
    operator,
    value: value.to_string(),
    weight,
    required: false,
    regex: None,
  }
}

/// The built-in pattern set.
pub fn default_patterns() -> Vec<TrafficPattern> {
  vec![
    TrafficPattern {
      kind: PatternKind::Api,
      name: "REST API".to_string(),
      description: "RESTful API call".to_string(),
      priority: 10,
      confidence_weight: 0.8,
      enabled: true,
      rules: vec![
        sub_rule(RuleField::Path, RuleOp::Regex, r"^/api/", 0.4),
        sub_rule(RuleField::ContentType, RuleOp::Contains, "application/json", 0.3),
        sub_rule(RuleField::Method, RuleOp::In, "GET,POST,PUT,DELETE,PATCH", 0.3),
      ],
    },
    TrafficPattern {
      kind: PatternKind::WebPage,
      name: "Web Page".to_string(),
      description: "Browser page view".to_string(),
      priority: 20,
      confidence_weight: 0.7,
      enabled: true,
      rules: vec![
        sub_rule(RuleField::Method, RuleOp::Equals, "GET", 0.2),
        sub_rule(RuleField::Header, RuleOp::Contains, "text/html", 0.4),
        sub_rule(
          RuleField::UserAgent,
          RuleOp::Regex,
          r"Mozilla|Chrome|Safari|Firefox",
          0.4,
        ),
      ],
    },
    TrafficPattern {
      kind: PatternKind::Download,
      name: "File Download".to_string(),
      description: "Archive or document fetch".to_string(),
      priority: 15,
      confidence_weight: 0.8,
      enabled: true,
      rules: vec![
        sub_rule(RuleField::Method, RuleOp::Equals, "GET", 0.2),
        sub_rule(
          RuleField::Path,
          RuleOp::Regex,
          r"\.(zip|rar|exe|dmg|pkg|deb|rpm|tar|gz|pdf|doc|xls|ppt)$",
          0.5,
        ),
        sub_rule(
          RuleField::ContentType,
          RuleOp::Contains,
          "application/octet-stream",
          0.3,
        ),
      ],
    },
    TrafficPattern {
      kind: PatternKind::Bot,
      name: "Bot/Crawler".to_string(),
      description: "Automated client".to_string(),
      priority: 5,
      confidence_weight: 0.9,
      enabled: true,
      rules: vec![
        sub_rule(
          RuleField::UserAgent,
          RuleOp::Regex,
          r"(?i)(bot|crawler|spider|scraper|curl|wget|python|java)",
          0.6,
        ),
        sub_rule(RuleField::Header, RuleOp::Contains, "bot", 0.4),
      ],
    },
    TrafficPattern {
      kind: PatternKind::Attack,
      name: "Attack Pattern".to_string(),
      description: "Suspicious payload".to_string(),
      priority: 1,
      confidence_weight: 0.8,
      enabled: true,
      rules: vec![
        sub_rule(
          RuleField::Path,
          RuleOp::Regex,
          r"(?i)(union|select|insert|update|delete|drop|exec|script|alert|onload|onerror)",
          0.4,
        ),
        sub_rule(
          RuleField::Query,
          RuleOp::Regex,
          r"(?i)(\.\./|\.\.\\|/etc/passwd|cmd\.exe|powershell)",
          0.4,
        ),
        sub_rule(
          RuleField::UserAgent,
          RuleOp::Regex,
          r"(?i)(sqlmap|nmap|nikto|burp|zap)",
          0.2,
        ),
      ],
    },
    TrafficPattern {
      kind: PatternKind::Static,
      name: "Static Resource".to_string(),
      description: "Asset fetch".to_string(),
      priority: 30,
      confidence_weight: 0.9,
      enabled: true,
      rules: vec![
        sub_rule(RuleField::Method, RuleOp::Equals, "GET", 0.2),
        sub_rule(
          RuleField::Path,
          RuleOp::Regex,
          r"\.(css|js|png|jpg|jpeg|gif|svg|ico|woff|woff2|ttf|eot)$",
          0.6,
        ),
        sub_rule(
          RuleField::ContentType,
          RuleOp::Regex,
          r"^(text/css|application/javascript|image/|font/)",
          0.2,
        ),
      ],
    },
    TrafficPattern {
      kind: PatternKind::Auth,
      name: "Authentication".to_string(),
      description: "Login or registration flow".to_string(),
      priority: 8,
      confidence_weight: 0.8,
      enabled: true,
      rules: vec![
        sub_rule(
          RuleField::Path,
          RuleOp::Regex,
          r"(?i)/(login|logout|auth|signin|signup|register|oauth)",
          0.5,
        ),
        sub_rule(RuleField::Method, RuleOp::Equals, "POST", 0.3),
        sub_rule(
          RuleField::ContentType,
          RuleOp::Contains,
          "application/x-www-form-urlencoded",
          0.2,
        ),
      ],
    },
  ]
}

/// Pipeline adapter: classifies every exchange and records the outcome in
/// the context metadata under `traffic_pattern`.
pub struct PatternHandler {
  recognizer: Arc<PatternRecognizer>,
}

impl PatternHandler {
  /// Wrap a recogniser for pipeline use.
  pub fn new(recognizer: Arc<PatternRecognizer>) -> Self {
    Self { recognizer }
  }
}

#[async_trait]
impl ResponseHandler for PatternHandler {
  async fn handle_response(
    &self,
    response: &mut Response,
    request: &Request,
    ctx: &mut ExchangeContext,
  ) -> Result<()> {
    let info = TrafficInfo::from_exchange(request, response, ctx);
    let matched = self.recognizer.recognize(&info);
    if matched.kind != PatternKind::Unknown {
      tracing::debug!(
        "[pattern] {} classified as {:?} ({:.2})",
        ctx.url,
        matched.kind,
        matched.confidence
      );
    }
    ctx.metadata.insert(
      "traffic_pattern".to_string(),
      serde_json::json!({
        "kind": matched.kind,
        "name": matched.name,
        "confidence": matched.confidence,
      }),
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn info(method: &str, path: &str, user_agent: &str) -> TrafficInfo {
    let mut headers = BTreeMap::new();
    headers.insert("user-agent".to_string(), user_agent.to_string());
    TrafficInfo {
      method: method.to_string(),
      url: format!("http://example.com{}", path),
      path: path.to_string(),
      user_agent: user_agent.to_string(),
      headers,
      ..Default::default()
    }
  }

  #[test]
  fn recognizes_bot_user_agent() {
    let recognizer = PatternRecognizer::with_default_patterns();
    let matched = recognizer.recognize(&info(
      "GET",
      "/",
      "Mozilla/5.0 (compatible; Googlebot/2.1)",
    ));
    assert_eq!(matched.kind, PatternKind::Bot);
    assert!(matched.confidence >= 0.6);
  }

  #[test]
  fn recognizes_api_call() {
    let recognizer = PatternRecognizer::with_default_patterns();
    let mut traffic = info("POST", "/api/v1/users", "client/1.0");
    traffic.content_type = "application/json".to_string();
    let matched = recognizer.recognize(&traffic);
    assert_eq!(matched.kind, PatternKind::Api);
  }

  #[test]
  fn unknown_below_threshold() {
    let recognizer = PatternRecognizer::with_default_patterns();
    let matched = recognizer.recognize(&info("PROPFIND", "/dav", "client/1.0"));
    assert_eq!(matched.kind, PatternKind::Unknown);
    assert_eq!(matched.confidence, 0.0);
  }

  #[test]
  fn required_rule_gates_the_pattern() {
    let recognizer = PatternRecognizer::new();
    let mut rules = vec![
      sub_rule(RuleField::Method, RuleOp::Equals, "GET", 0.5),
      sub_rule(RuleField::Path, RuleOp::StartsWith, "/admin", 0.5),
    ];
    rules[1].required = true;
    recognizer
      .add_pattern(TrafficPattern {
        kind: PatternKind::Admin,
        name: "Admin".to_string(),
        description: String::new(),
        rules,
        priority: 1,
        confidence_weight: 1.0,
        enabled: true,
      })
      .unwrap();
    assert_eq!(
      recognizer.recognize(&info("GET", "/admin/panel", "x")).kind,
      PatternKind::Admin
    );
    assert_eq!(
      recognizer.recognize(&info("GET", "/public", "x")).kind,
      PatternKind::Unknown
    );
  }

  #[test]
  fn ties_break_by_priority() {
    let recognizer = PatternRecognizer::new();
    for (kind, priority) in [(PatternKind::Search, 9), (PatternKind::Form, 3)] {
      recognizer
        .add_pattern(TrafficPattern {
          kind,
          name: format!("{:?}", kind),
          description: String::new(),
          rules: vec![sub_rule(RuleField::Method, RuleOp::Equals, "GET", 1.0)],
          priority,
          confidence_weight: 1.0,
          enabled: true,
        })
        .unwrap();
    }
    let matched = recognizer.recognize(&info("GET", "/x", "ua"));
    assert_eq!(matched.kind, PatternKind::Form);
  }

  #[test]
  fn json_round_trip() {
    let recognizer = PatternRecognizer::with_default_patterns();
    let exported = recognizer.export_json().unwrap();
    let fresh = PatternRecognizer::new();
    let count = fresh.load_from_json(&exported).unwrap();
    assert_eq!(count, default_patterns().len());
    assert_eq!(
      fresh
        .recognize(&info("GET", "/", "Mozilla/5.0 (compatible; Googlebot/2.1)"))
        .kind,
      PatternKind::Bot
    );
  }
}
