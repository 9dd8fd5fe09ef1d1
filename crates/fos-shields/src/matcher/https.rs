//! HTTPS Upgrade Matcher
//!
//! Rewrites `http://` URLs to `https://` for hosts known to serve HTTPS.
//!
//! Rule file, one entry per line:
//! - `example.com`: exactly this host
//! - `*.example.com`: any subdomain (not the bare domain)
//! - `!legacy.example.com`: never upgrade this host, wins over the above
//!
//! Only `http` URLs without an explicit port are rewritten. The rewritten
//! URL is `https`, so a second query never matches again.

use super::{MatchResult, Matcher, MatcherKind, RuleSetCell};
use crate::domain::host_suffixes;
use crate::error::ShieldError;
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;

/// Immutable upgrade rules
#[derive(Debug, Default)]
pub struct HttpsRules {
    exact: HashSet<String>,
    wildcard: HashSet<String>,
    excluded: HashSet<String>,
}

impl HttpsRules {
    pub fn parse(content: &str) -> Self {
        let mut rules = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            rules.add(line);
        }

        rules
    }

    /// Add one rule entry
    pub fn add(&mut self, entry: &str) {
        let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
        if let Some(host) = entry.strip_prefix('!') {
            self.excluded.insert(host.to_string());
        } else if let Some(domain) = entry.strip_prefix("*.") {
            self.wildcard.insert(domain.to_string());
        } else if !entry.is_empty() {
            self.exact.insert(entry);
        }
    }

    /// Whether the host is known to support HTTPS
    pub fn supports_https(&self, host: &str) -> bool {
        if self.excluded.contains(host) {
            return false;
        }
        if self.exact.contains(host) {
            return true;
        }
        host_suffixes(host)
            .skip(1)
            .any(|parent| self.wildcard.contains(parent))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len() + self.excluded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct HttpsUpgradeMatcher {
    rules: RuleSetCell<HttpsRules>,
}

impl HttpsUpgradeMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, rules: HttpsRules) -> u64 {
        let count = rules.len();
        let version = self.rules.publish(rules);
        info!("HTTPS upgrade rules loaded: {} entries (v{})", count, version);
        version
    }

    pub fn load_str(&self, content: &str) -> u64 {
        self.load(HttpsRules::parse(content))
    }

    pub fn unload(&self) {
        self.rules.unload();
    }
}

impl Matcher for HttpsUpgradeMatcher {
    fn kind(&self) -> MatcherKind {
        MatcherKind::HttpsUpgrade
    }

    fn is_loaded(&self) -> bool {
        self.rules.is_loaded()
    }

    fn query(
        &self,
        url: &Url,
        _page_domain: &str,
        _accept: Option<&str>,
    ) -> Result<MatchResult, ShieldError> {
        let no_match = MatchResult::no_match(MatcherKind::HttpsUpgrade);

        let Some(rules) = self.rules.load() else {
            return Ok(no_match);
        };
        if url.scheme() != "http" || url.port().is_some() {
            return Ok(no_match);
        }
        let Some(host) = url.host_str() else {
            return Ok(no_match);
        };
        if !rules.supports_https(host) {
            return Ok(no_match);
        }

        let mut upgraded = url.clone();
        if upgraded.set_scheme("https").is_err() {
            return Err(ShieldError::MatcherFailed {
                kind: MatcherKind::HttpsUpgrade,
                url: url.to_string(),
                reason: "scheme rewrite rejected".to_string(),
            });
        }

        debug!("HTTPS upgrade: {} -> {}", url, upgraded);
        Ok(MatchResult::rewrite(MatcherKind::HttpsUpgrade, upgraded))
    }
}
