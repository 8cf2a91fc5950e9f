//! Attack signature scanning.
//!
//! Rules are case-insensitive regular expressions bound to parts of the
//! request. Rules are evaluated in order and the first hit wins; within a rule
//! the targets are inspected as path, query, headers, body.

use async_trait::async_trait;
use axum::http::header;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;

use crate::config::WafConfig;
use crate::core::request::ClientRequest;
use crate::utils::{ShieldError, ShieldResult};
use ScanTarget::{Body, Headers, Path as UrlPath, Query};

/// Part of the request a rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanTarget {
    Path,
    Query,
    Headers,
    Body,
}

impl ScanTarget {
    const ALL: [ScanTarget; 4] = [
        ScanTarget::Path,
        ScanTarget::Query,
        ScanTarget::Headers,
        ScanTarget::Body,
    ];
}

/// A signature hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMatch {
    pub rule_id: String,
    pub comment: String,
    pub category: String,
    /// Where the hit occurred: `path`, `query:{name}`, `header:{name}` or `body`
    pub location: String,
}

/// Inspects a request against a signature set
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttackScanner: Send + Sync {
    /// `Ok(None)` when the request is clean
    async fn scan(&self, request: &ClientRequest) -> ShieldResult<Option<ScanMatch>>;
}

/// Serialized form of a rule, as found in rule files
#[derive(Debug, Clone, Deserialize)]
pub struct WafRuleSpec {
    pub id: String,
    pub comment: String,
    pub category: String,
    pub pattern: String,
    #[serde(default)]
    pub targets: Vec<ScanTarget>,
}

/// A compiled signature
#[derive(Debug, Clone)]
pub struct WafRule {
    pub id: String,
    pub comment: String,
    pub category: String,
    pattern: Regex,
    targets: Vec<ScanTarget>,
}

impl WafRule {
    /// Compile a rule. An empty target list means every target.
    pub fn new(
        id: &str,
        comment: &str,
        category: &str,
        pattern: &str,
        targets: &[ScanTarget],
    ) -> ShieldResult<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ShieldError::InvalidRule {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        let targets = if targets.is_empty() {
            ScanTarget::ALL.to_vec()
        } else {
            targets.to_vec()
        };

        Ok(Self {
            id: id.to_string(),
            comment: comment.to_string(),
            category: category.to_string(),
            pattern,
            targets,
        })
    }

    fn hit(&self, location: impl Into<String>) -> ScanMatch {
        ScanMatch {
            rule_id: self.id.clone(),
            comment: self.comment.clone(),
            category: self.category.clone(),
            location: location.into(),
        }
    }
}

impl TryFrom<WafRuleSpec> for WafRule {
    type Error = ShieldError;

    fn try_from(spec: WafRuleSpec) -> Result<Self, Self::Error> {
        WafRule::new(&spec.id, &spec.comment, &spec.category, &spec.pattern, &spec.targets)
    }
}

/// id, comment, category, pattern, targets
const BUILTIN_RULES: &[(&str, &str, &str, &str, &[ScanTarget])] = &[
    (
        "930100",
        "Path traversal attack (../)",
        "lfi",
        r"(\.\.|%2e%2e|%252e%252e)(/|\\|%2f|%5c|%252f)",
        &[UrlPath, Query, Body],
    ),
    (
        "930120",
        "OS file access attempt",
        "lfi",
        r"(/etc/(passwd|shadow|hosts)|/proc/self/environ|\bwin\.ini\b|\bboot\.ini\b)",
        &[UrlPath, Query, Body],
    ),
    (
        "932100",
        "Remote command execution: Unix command injection",
        "rce",
        r"(;|\|\|?|&&|\$\(|`)\s*(cat|ls|id|whoami|uname|wget|curl|nc|bash|sh|python|perl)\b",
        &[Query, Body],
    ),
    (
        "941100",
        "XSS attack detected: script tag",
        "xss",
        r"<\s*script\b",
        &[UrlPath, Query, Body],
    ),
    (
        "941110",
        "XSS attack detected: event handler attribute",
        "xss",
        r"<[^>]*\bon(error|load|click|mouseover|focus|submit)\s*=",
        &[Query, Body],
    ),
    (
        "941120",
        "XSS attack detected: javascript URI",
        "xss",
        r"javascript\s*:",
        &[Query, Body],
    ),
    (
        "942100",
        "SQL injection attack: UNION SELECT",
        "sqli",
        r"\bunion\b(\s|/\*.*?\*/)+(all(\s|/\*.*?\*/)+)?select\b",
        &[Query, Body],
    ),
    (
        "942110",
        "SQL injection attack: tautology",
        "sqli",
        r"'\s*(or|and)\s+'?\w+'?\s*=\s*'?\w+",
        &[Query, Body],
    ),
    (
        "942120",
        "SQL injection attack: stacked query",
        "sqli",
        r";\s*(drop|delete|insert|update|alter|truncate|exec)\b",
        &[Query, Body],
    ),
    (
        "942130",
        "SQL injection attack: time-based blind",
        "sqli",
        r"\b(sleep|pg_sleep|benchmark)\s*\(|\bwaitfor\s+delay\b",
        &[Query, Body],
    ),
    (
        "944150",
        "Log4j JNDI lookup",
        "rce",
        r"\$\{\s*jndi\s*:",
        &[UrlPath, Query, Headers, Body],
    ),
    (
        "913100",
        "Request from a known security scanner",
        "scanner",
        r"\b(sqlmap|nikto|nmap|masscan|acunetix|nessus|dirbuster|wpscan|zgrab)\b",
        &[Headers],
    ),
];

/// Regex signature engine
pub struct SignatureScanner {
    rules: Vec<WafRule>,
    max_body_bytes: usize,
}

impl SignatureScanner {
    pub fn new(rules: Vec<WafRule>, max_body_bytes: usize) -> Self {
        Self {
            rules,
            max_body_bytes,
        }
    }

    /// Build the scanner described by the configuration
    pub fn from_config(config: &WafConfig) -> ShieldResult<Self> {
        let mut rules = if config.builtin_rules {
            Self::builtin_rules()?
        } else {
            Vec::new()
        };
        if let Some(path) = &config.rules_path {
            rules.extend(Self::load_rules(Path::new(path))?);
        }

        tracing::info!(rules = rules.len(), "WAF signature set loaded");
        Ok(Self::new(rules, config.max_body_bytes))
    }

    pub fn builtin_rules() -> ShieldResult<Vec<WafRule>> {
        BUILTIN_RULES
            .iter()
            .map(|(id, comment, category, pattern, targets)| {
                WafRule::new(id, comment, category, pattern, targets)
            })
            .collect()
    }

    /// Load rules from a JSON array of rule objects
    pub fn load_rules(path: &Path) -> ShieldResult<Vec<WafRule>> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse_rules(&raw)
    }

    pub fn parse_rules(raw: &str) -> ShieldResult<Vec<WafRule>> {
        let specs: Vec<WafRuleSpec> = serde_json::from_str(raw)?;
        specs.into_iter().map(WafRule::try_from).collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Synchronous inspection used by the async scanner
    pub fn inspect(&self, request: &ClientRequest) -> Option<ScanMatch> {
        let body = self.body_text(request);
        let form_fields = Self::form_fields(request, &body);

        for rule in &self.rules {
            for target in &rule.targets {
                let hit = match target {
                    ScanTarget::Path => rule
                        .pattern
                        .is_match(&request.path)
                        .then(|| rule.hit("path")),
                    ScanTarget::Query => request
                        .query_params
                        .iter()
                        .find(|(name, value)| {
                            rule.pattern.is_match(name) || rule.pattern.is_match(value)
                        })
                        .map(|(name, _)| rule.hit(format!("query:{}", name))),
                    ScanTarget::Headers => request
                        .headers
                        .iter()
                        .find(|(_, value)| {
                            value
                                .to_str()
                                .map(|v| rule.pattern.is_match(v))
                                .unwrap_or(false)
                        })
                        .map(|(name, _)| rule.hit(format!("header:{}", name.as_str()))),
                    ScanTarget::Body => {
                        let raw_hit = !body.is_empty() && rule.pattern.is_match(&body);
                        let form_hit = form_fields
                            .iter()
                            .any(|(name, value)| {
                                rule.pattern.is_match(name) || rule.pattern.is_match(value)
                            });
                        (raw_hit || form_hit).then(|| rule.hit("body"))
                    }
                };
                if hit.is_some() {
                    return hit;
                }
            }
        }
        None
    }

    fn body_text<'a>(&self, request: &'a ClientRequest) -> Cow<'a, str> {
        let end = request.body.len().min(self.max_body_bytes);
        String::from_utf8_lossy(&request.body[..end])
    }

    /// Decoded fields of a form-encoded body
    fn form_fields(request: &ClientRequest, body: &str) -> Vec<(String, String)> {
        let is_form = request
            .header(header::CONTENT_TYPE.as_str())
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if !is_form {
            return Vec::new();
        }
        url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect()
    }
}

#[async_trait]
impl AttackScanner for SignatureScanner {
    async fn scan(&self, request: &ClientRequest) -> ShieldResult<Option<ScanMatch>> {
        Ok(self.inspect(request))
    }
}
