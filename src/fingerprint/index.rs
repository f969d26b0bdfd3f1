//! Three-tier rule index
//!
//! L1 filters on header tokens and URL path substrings, L2 on title and body
//! keywords, L3 runs the precompiled regex rules. Every candidate surfaced
//! by an index key is verified against its full keyword set before it
//! counts.

use super::{FingerprintRule, HttpSample, MatchLocation, MatchMethod};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub(crate) struct LayeredIndex {
  header_index: HashMap<String, Vec<Arc<FingerprintRule>>>,
  path_index: HashMap<String, Vec<Arc<FingerprintRule>>>,
  title_index: HashMap<String, Vec<Arc<FingerprintRule>>>,
  body_index: HashMap<String, Vec<Arc<FingerprintRule>>>,
  regex_rules: Vec<Arc<FingerprintRule>>,
  favicon_rules: Vec<Arc<FingerprintRule>>,
}

/// Sizes of the index tiers.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IndexStats {
  /// Distinct header tokens
  pub header_keys: usize,
  /// Distinct path substrings
  pub path_keys: usize,
  /// Distinct title keywords
  pub title_keys: usize,
  /// Distinct body keywords
  pub body_keys: usize,
  /// Sequentially scanned regex rules
  pub regex_rules: usize,
  /// Deferred favicon rules
  pub favicon_rules: usize,
}

impl LayeredIndex {
  pub fn build(rules: &[Arc<FingerprintRule>]) -> Self {
    let mut index = LayeredIndex {
      header_index: HashMap::new(),
      path_index: HashMap::new(),
      title_index: HashMap::new(),
      body_index: HashMap::new(),
      regex_rules: Vec::new(),
      favicon_rules: Vec::new(),
    };
    for rule in rules {
      match rule.method {
        MatchMethod::Keyword => index.index_keyword_rule(rule),
        MatchMethod::FaviconHash => index.favicon_rules.push(Arc::clone(rule)),
        MatchMethod::Regex => index.regex_rules.push(Arc::clone(rule)),
      }
    }
    index
  }

  fn index_keyword_rule(&mut self, rule: &Arc<FingerprintRule>) {
    for keyword in &rule.keywords {
      let normalized = keyword.trim().to_ascii_lowercase();
      if normalized.is_empty() {
        continue;
      }
      let bucket = match rule.location {
        MatchLocation::Header => &mut self.header_index,
        MatchLocation::Title => &mut self.title_index,
        MatchLocation::Body => &mut self.body_index,
      };
      bucket
        .entry(normalized.clone())
        .or_default()
        .push(Arc::clone(rule));
      if normalized.contains('/') || normalized.contains('?') {
        self
          .path_index
          .entry(normalized)
          .or_default()
          .push(Arc::clone(rule));
      }
    }
  }

  /// Collect matching rules tier by tier, stopping at a tier boundary once
  /// `max_matches` unique rules matched.
  pub fn search(&self, sample: &HttpSample, max_matches: usize) -> Vec<Arc<FingerprintRule>> {
    let mut matched: Vec<Arc<FingerprintRule>> = Vec::new();
    let mut seen: HashSet<usize> = HashSet::new();
    self.search_layer1(sample, &mut matched, &mut seen);
    if matched.len() >= max_matches {
      return matched;
    }
    self.search_layer2(sample, &mut matched, &mut seen);
    if matched.len() >= max_matches {
      return matched;
    }
    self.search_layer3(sample, &mut matched, &mut seen);
    matched
  }

  fn search_layer1(
    &self,
    sample: &HttpSample,
    matched: &mut Vec<Arc<FingerprintRule>>,
    seen: &mut HashSet<usize>,
  ) {
    for (name, value) in &sample.headers {
      let token = format!("{}:{}", name, value).to_ascii_lowercase();
      for (key, rules) in &self.header_index {
        if token.contains(key.as_str()) {
          for rule in rules {
            self.admit(rule, sample, matched, seen);
          }
        }
      }
    }
    let url = sample.url.to_ascii_lowercase();
    for (key, rules) in &self.path_index {
      if url.contains(key.as_str()) {
        for rule in rules {
          self.admit(rule, sample, matched, seen);
        }
      }
    }
  }

  fn search_layer2(
    &self,
    sample: &HttpSample,
    matched: &mut Vec<Arc<FingerprintRule>>,
    seen: &mut HashSet<usize>,
  ) {
    let title = sample.title.to_ascii_lowercase();
    for (key, rules) in &self.title_index {
      if title.contains(key.as_str()) {
        for rule in rules {
          self.admit(rule, sample, matched, seen);
        }
      }
    }
    let body = sample.body.to_ascii_lowercase();
    for (key, rules) in &self.body_index {
      if body.contains(key.as_str()) {
        for rule in rules {
          self.admit(rule, sample, matched, seen);
        }
      }
    }
  }

  fn search_layer3(
    &self,
    sample: &HttpSample,
    matched: &mut Vec<Arc<FingerprintRule>>,
    seen: &mut HashSet<usize>,
  ) {
    for rule in &self.regex_rules {
      if seen.contains(&rule_id(rule)) {
        continue;
      }
      if regex_matches(rule, sample) {
        seen.insert(rule_id(rule));
        matched.push(Arc::clone(rule));
      }
    }
    // Favicon rules need a fetch of the icon itself; identification stays
    // passive, so they are indexed but deferred here.
  }

  fn admit(
    &self,
    rule: &Arc<FingerprintRule>,
    sample: &HttpSample,
    matched: &mut Vec<Arc<FingerprintRule>>,
    seen: &mut HashSet<usize>,
  ) {
    if seen.contains(&rule_id(rule)) {
      return;
    }
    if keywords_match(rule, sample) {
      seen.insert(rule_id(rule));
      matched.push(Arc::clone(rule));
    }
  }

  pub fn stats(&self) -> IndexStats {
    IndexStats {
      header_keys: self.header_index.len(),
      path_keys: self.path_index.len(),
      title_keys: self.title_index.len(),
      body_keys: self.body_index.len(),
      regex_rules: self.regex_rules.len(),
      favicon_rules: self.favicon_rules.len(),
    }
  }
}

fn rule_id(rule: &Arc<FingerprintRule>) -> usize {
  Arc::as_ptr(rule) as usize
}

fn location_content(rule: &FingerprintRule, sample: &HttpSample) -> String {
  match rule.location {
    MatchLocation::Body => sample.body.clone(),
    MatchLocation::Header => sample.headers_as_lines(),
    MatchLocation::Title => sample.title.clone(),
  }
}

/// Full AND verification: every keyword must appear, case-insensitively, in
/// the rule's location.
fn keywords_match(rule: &FingerprintRule, sample: &HttpSample) -> bool {
  if rule.keywords.is_empty() {
    return false;
  }
  let content = location_content(rule, sample).to_ascii_lowercase();
  rule
    .keywords
    .iter()
    .all(|keyword| content.contains(&keyword.to_ascii_lowercase()))
}

fn regex_matches(rule: &FingerprintRule, sample: &HttpSample) -> bool {
  if rule.compiled.is_empty() {
    return false;
  }
  let content = location_content(rule, sample);
  rule.compiled.iter().all(|re| re.is_match(&content))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn keyword_rule(cms: &str, location: MatchLocation, keywords: &[&str]) -> Arc<FingerprintRule> {
    Arc::new(FingerprintRule {
      cms: cms.to_string(),
      method: MatchMethod::Keyword,
      location,
      keywords: keywords.iter().map(|s| s.to_string()).collect(),
      compiled: Vec::new(),
    })
  }

  fn sample_with_body(body: &str) -> HttpSample {
    HttpSample {
      url: "http://example.com/".to_string(),
      status: 200,
      headers: BTreeMap::new(),
      body: body.to_string(),
      title: String::new(),
    }
  }

  #[test]
  fn early_exit_respects_max_matches() {
    let rules: Vec<Arc<FingerprintRule>> = (0..8)
      .map(|i| keyword_rule(&format!("cms-{}", i), MatchLocation::Body, &["shared-token"]))
      .collect();
    let index = LayeredIndex::build(&rules);
    let matched = index.search(&sample_with_body("page with shared-token inside"), 3);
    assert!(matched.len() >= 3);
    // Layer 3 never ran: no regex rules exist, and layer 2 already
    // satisfied the bound.
    assert!(matched.len() <= 8);
  }

  #[test]
  fn candidate_must_verify_all_keywords() {
    let rules = vec![keyword_rule(
      "TwoWords",
      MatchLocation::Body,
      &["alpha", "beta"],
    )];
    let index = LayeredIndex::build(&rules);
    // "alpha" alone surfaces the rule via the body index, but verification
    // requires both keywords.
    assert!(index.search(&sample_with_body("only alpha here"), 10).is_empty());
    assert_eq!(
      index
        .search(&sample_with_body("alpha and beta here"), 10)
        .len(),
      1
    );
  }

  #[test]
  fn favicon_rules_are_deferred() {
    let rules = vec![Arc::new(FingerprintRule {
      cms: "IconCms".to_string(),
      method: MatchMethod::FaviconHash,
      location: MatchLocation::Body,
      keywords: vec!["12345".to_string()],
      compiled: Vec::new(),
    })];
    let index = LayeredIndex::build(&rules);
    assert_eq!(index.stats().favicon_rules, 1);
    assert!(index.search(&sample_with_body("12345"), 10).is_empty());
  }
}
