//! Filter List Parser (EasyList Format)
//!
//! Parses the network subset of EasyList / AdBlock Plus syntax.
//! Supports:
//! - Domain anchors: ||example.com^ and ||example.com/ads/*
//! - Start anchors: |https://ads.
//! - Substring patterns with `*` wildcards and `^` separators
//! - End anchors: pattern|
//! - Exception rules: @@||allowed.com^
//! - Options: $third-party, $~third-party, $script, $image, ...,
//!   $domain=a.com|~b.com
//! - Comments: ! or [Adblock Plus...]
//!
//! Cosmetic (`##`) and regex (`/.../`) rules are skipped, as are rules with
//! options we do not understand: a rule applied too broadly breaks pages.
//!
//! Substring rules are indexed by their longest literal run in an
//! Aho-Corasick automaton, so a query only verifies rules whose token
//! actually occurs in the URL.

use super::ResourceType;
use crate::domain::{host_matches_suffix, host_suffixes, is_third_party, normalize_host};
use aho_corasick::AhoCorasick;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use thiserror::Error;
use tracing::{debug, info};
use url::{Position, Url};

/// Shortest literal a substring rule needs, anything shorter matches too much
const MIN_TOKEN_LEN: usize = 3;

const ALL_RESOURCE_TYPES: [ResourceType; 8] = [
    ResourceType::Document,
    ResourceType::Stylesheet,
    ResourceType::Script,
    ResourceType::Image,
    ResourceType::Font,
    ResourceType::XmlHttpRequest,
    ResourceType::Media,
    ResourceType::Other,
];

/// Errors during filter list parsing
#[derive(Debug, Error)]
pub enum FilterListError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty filter list: {0}")]
    EmptyList(String),

    #[error("Failed to build pattern automaton: {0}")]
    Automaton(String),
}

/// Action to take when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Block the request
    Block,
    /// Allow the request (exception rule)
    Allow,
}

/// Where a rule's pattern is anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// ||host^...: the host or any subdomain, then the rest of the pattern
    DomainAnchor,
    /// |pattern: the URL starts with the pattern
    StartsWith,
    /// pattern: anywhere in the URL
    Contains,
}

/// Request-dependent restrictions from the `$` part of a rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOptions {
    /// `Some(true)` third-party only, `Some(false)` first-party only
    pub third_party: Option<bool>,
    /// Resource types the rule applies to, `None` for all
    pub resource_types: Option<Vec<ResourceType>>,
    /// Page domains the rule is limited to
    pub include_domains: Vec<String>,
    /// Page domains the rule never applies on
    pub exclude_domains: Vec<String>,
}

impl RuleOptions {
    /// Parse a comma-separated option list. `None` if any option is unknown.
    fn parse(options: &str) -> Option<Self> {
        let mut parsed = Self::default();
        let mut included = Vec::new();
        let mut excluded = Vec::new();

        for raw in options.split(',') {
            let option = raw.trim().to_ascii_lowercase();
            let (negated, name) = match option.strip_prefix('~') {
                Some(name) => (true, name),
                None => (false, option.as_str()),
            };

            if let Some(domains) = name.strip_prefix("domain=") {
                for domain in domains.split('|').filter(|d| !d.is_empty()) {
                    match domain.strip_prefix('~') {
                        Some(domain) => parsed.exclude_domains.push(normalize_host(domain)),
                        None => parsed.include_domains.push(normalize_host(domain)),
                    }
                }
                continue;
            }

            match name {
                "third-party" | "3p" => parsed.third_party = Some(!negated),
                "first-party" | "1p" => parsed.third_party = Some(negated),
                "important" => {}
                other => {
                    let resource_type = ResourceType::from_option(other)?;
                    if negated {
                        excluded.push(resource_type);
                    } else {
                        included.push(resource_type);
                    }
                }
            }
        }

        if !included.is_empty() {
            parsed.resource_types = Some(included);
        } else if !excluded.is_empty() {
            parsed.resource_types = Some(
                ALL_RESOURCE_TYPES
                    .iter()
                    .copied()
                    .filter(|t| !excluded.contains(t))
                    .collect(),
            );
        }

        Some(parsed)
    }

    fn applies_to(&self, request: &RuleRequest<'_>) -> bool {
        if let Some(third_party) = self.third_party {
            if third_party != request.third_party {
                return false;
            }
        }

        if let Some(types) = &self.resource_types {
            if !types.contains(&request.resource_type) {
                return false;
            }
        }

        if !self.include_domains.is_empty()
            && !self
                .include_domains
                .iter()
                .any(|d| host_matches_suffix(request.page_domain, d))
        {
            return false;
        }

        !self
            .exclude_domains
            .iter()
            .any(|d| host_matches_suffix(request.page_domain, d))
    }
}

/// A single network filter rule
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Original rule text
    pub raw: String,
    /// Lower-cased glob (`*` any run, `^` separator) with anchors applied
    pub pattern: String,
    /// Host for `DomainAnchor` rules
    pub anchor_host: Option<String>,
    pub rule_type: RuleType,
    pub action: FilterAction,
    pub options: RuleOptions,
}

impl FilterRule {
    /// Parse one line; `None` for comments, cosmetic rules and anything
    /// we cannot apply safely
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
            return None;
        }
        if ["##", "#@#", "#?#", "#$#"].iter().any(|m| trimmed.contains(m)) {
            return None;
        }

        let (action, body) = match trimmed.strip_prefix("@@") {
            Some(rest) => (FilterAction::Allow, rest),
            None => (FilterAction::Block, trimmed),
        };

        let (pattern, options) = match body.rfind('$') {
            Some(idx) => (&body[..idx], RuleOptions::parse(&body[idx + 1..])?),
            None => (body, RuleOptions::default()),
        };

        let pattern = pattern.to_ascii_lowercase();
        if pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/') {
            return None; // regex rule
        }

        let (pattern, end_anchored) = match pattern.strip_suffix('|') {
            Some(p) if !p.is_empty() => (p, true),
            _ => (pattern.as_str(), false),
        };
        let tail = if end_anchored { "" } else { "*" };

        let (rule_type, anchor_host, glob) = if let Some(rest) = pattern.strip_prefix("||") {
            let split = rest
                .find(|c| matches!(c, '/' | '^' | '*' | ':' | '?'))
                .unwrap_or(rest.len());
            let host = &rest[..split];
            if host.is_empty() {
                return None;
            }
            (
                RuleType::DomainAnchor,
                Some(host.to_string()),
                format!("{}{}", &rest[split..], tail),
            )
        } else if let Some(rest) = pattern.strip_prefix('|') {
            (RuleType::StartsWith, None, format!("{}{}", rest, tail))
        } else {
            (RuleType::Contains, None, format!("*{}{}", pattern, tail))
        };

        if rule_type != RuleType::DomainAnchor && longest_literal(&glob).len() < MIN_TOKEN_LEN {
            return None;
        }

        Some(Self {
            raw: trimmed.to_string(),
            pattern: glob,
            anchor_host,
            rule_type,
            action,
            options,
        })
    }

    /// Check if this rule matches a request
    pub fn matches(&self, request: &RuleRequest<'_>) -> bool {
        if !self.options.applies_to(request) {
            return false;
        }

        match self.rule_type {
            RuleType::DomainAnchor => {
                let Some(host) = &self.anchor_host else {
                    return false;
                };
                host_matches_suffix(request.host, host)
                    && wildcard_match(self.pattern.as_bytes(), request.after_host.as_bytes())
            }
            RuleType::StartsWith | RuleType::Contains => {
                wildcard_match(self.pattern.as_bytes(), request.url.as_bytes())
            }
        }
    }
}

/// A request prepared once for rule evaluation
#[derive(Debug)]
pub struct RuleRequest<'a> {
    /// Full URL, lower-cased
    url: String,
    /// Port, path, query and fragment, lower-cased
    after_host: String,
    host: &'a str,
    page_domain: &'a str,
    third_party: bool,
    resource_type: ResourceType,
}

impl<'a> RuleRequest<'a> {
    pub fn new(url: &'a Url, page_domain: &'a str, resource_type: ResourceType) -> Self {
        let host = url.host_str().unwrap_or_default();
        Self {
            url: url.as_str().to_ascii_lowercase(),
            after_host: url[Position::BeforePort..].to_ascii_lowercase(),
            host,
            page_domain,
            third_party: is_third_party(host, page_domain),
            resource_type,
        }
    }
}

/// Rules of one action, indexed for lookup
#[derive(Debug, Default)]
struct RuleIndex {
    rules: Vec<FilterRule>,
    by_host: HashMap<String, Vec<usize>>,
    tokens: Option<AhoCorasick>,
    token_rules: Vec<Vec<usize>>,
}

impl RuleIndex {
    fn build(rules: Vec<FilterRule>) -> Result<Self, FilterListError> {
        let mut by_host: HashMap<String, Vec<usize>> = HashMap::new();
        let mut token_ids: HashMap<String, usize> = HashMap::new();
        let mut tokens: Vec<String> = Vec::new();
        let mut token_rules: Vec<Vec<usize>> = Vec::new();

        for (idx, rule) in rules.iter().enumerate() {
            if let Some(host) = &rule.anchor_host {
                by_host.entry(host.clone()).or_default().push(idx);
                continue;
            }

            let token = longest_literal(&rule.pattern).to_string();
            let id = *token_ids.entry(token.clone()).or_insert_with(|| {
                tokens.push(token);
                token_rules.push(Vec::new());
                tokens.len() - 1
            });
            token_rules[id].push(idx);
        }

        let tokens = if tokens.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(&tokens).map_err(|e| FilterListError::Automaton(e.to_string()))?)
        };

        Ok(Self {
            rules,
            by_host,
            tokens,
            token_rules,
        })
    }

    fn find(&self, request: &RuleRequest<'_>) -> Option<&FilterRule> {
        for suffix in host_suffixes(request.host) {
            if let Some(ids) = self.by_host.get(suffix) {
                if let Some(rule) = ids.iter().map(|&id| &self.rules[id]).find(|r| r.matches(request)) {
                    return Some(rule);
                }
            }
        }

        let automaton = self.tokens.as_ref()?;
        automaton
            .find_overlapping_iter(request.url.as_str())
            .flat_map(|m| self.token_rules[m.pattern().as_usize()].iter())
            .map(|&id| &self.rules[id])
            .find(|rule| rule.matches(request))
    }

    fn len(&self) -> usize {
        self.rules.len()
    }
}

/// A complete, immutable filter list
#[derive(Debug)]
pub struct FilterList {
    /// Name of the filter list
    pub name: String,
    blocks: RuleIndex,
    exceptions: RuleIndex,
    /// Lines that were not usable network rules
    pub skipped: usize,
}

impl FilterList {
    /// Parse a filter list from a reader
    pub fn parse<R: Read>(name: &str, reader: R) -> Result<Self, FilterListError> {
        let buf_reader = BufReader::new(reader);
        let mut block_rules = Vec::new();
        let mut exception_rules = Vec::new();
        let mut line_count = 0;
        let mut skipped = 0;

        for line in buf_reader.lines() {
            let line = line?;
            line_count += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
                continue;
            }

            match FilterRule::parse(trimmed) {
                Some(rule) if rule.action == FilterAction::Allow => exception_rules.push(rule),
                Some(rule) => block_rules.push(rule),
                None => {
                    debug!("Skipping filter line: {}", trimmed);
                    skipped += 1;
                }
            }
        }

        if block_rules.is_empty() && exception_rules.is_empty() {
            return Err(FilterListError::EmptyList(name.to_string()));
        }

        let list = Self {
            name: name.to_string(),
            blocks: RuleIndex::build(block_rules)?,
            exceptions: RuleIndex::build(exception_rules)?,
            skipped,
        };

        info!(
            "Parsed filter list '{}': {} lines, {} rules ({} block, {} exception), {} skipped",
            name,
            line_count,
            list.rule_count(),
            list.blocks.len(),
            list.exceptions.len(),
            skipped
        );

        Ok(list)
    }

    /// Parse a filter list held in memory
    pub fn parse_str(name: &str, content: &str) -> Result<Self, FilterListError> {
        Self::parse(name, content.as_bytes())
    }

    /// Check if a request should be blocked; exceptions win over blocks
    pub fn should_block(&self, request: &RuleRequest<'_>) -> bool {
        if let Some(rule) = self.exceptions.find(request) {
            debug!("URL allowed by exception '{}': {}", rule.raw, request.url);
            return false;
        }

        match self.blocks.find(request) {
            Some(rule) => {
                debug!("URL blocked by rule '{}': {}", rule.raw, request.url);
                true
            }
            None => false,
        }
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.blocks.len() + self.exceptions.len()
    }
}

/// Longest run of literal characters in a glob
fn longest_literal(glob: &str) -> &str {
    glob.split(['*', '^'])
        .max_by_key(|segment| segment.len())
        .unwrap_or_default()
}

/// Characters that end a URL component for `^`
#[inline]
fn is_separator(c: u8) -> bool {
    !(c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b'%'))
}

/// Match the whole of `text` against a glob where `*` is any run and `^`
/// is a separator character or the end of the text
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
            continue;
        }

        let char_matches = p < pattern.len()
            && match pattern[p] {
                b'^' => is_separator(text[t]),
                c => c == text[t],
            };
        if char_matches {
            p += 1;
            t += 1;
            continue;
        }

        match backtrack {
            Some((star, start)) => {
                p = star + 1;
                t = start + 1;
                backtrack = Some((star, start + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*' || c == b'^')
}
