//! Safe Browsing Matcher
//!
//! Matches the request host, and every parent domain of it, against a set
//! of known-bad domains. Domains are stored as 64-bit xxh3 hashes: the set
//! can hold hundreds of thousands of entries without keeping the strings.
//!
//! Applies to first- and third-party requests alike, including the main
//! document itself.

use super::{MatchResult, Matcher, MatcherKind, RuleSetCell, domain_lines};
use crate::domain::host_suffixes;
use crate::error::ShieldError;
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// Immutable set of hashed bad domains
#[derive(Debug, Default)]
pub struct BadDomainSet {
    hashes: HashSet<u64>,
}

impl BadDomainSet {
    /// Parse one domain per line
    pub fn parse(content: &str) -> Self {
        Self {
            hashes: domain_lines(content).map(|d| hash_domain(&d)).collect(),
        }
    }

    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hashes: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .map(|d| hash_domain(&d))
                .collect(),
        }
    }

    /// Check the host and its parent domains
    pub fn contains_host(&self, host: &str) -> bool {
        host_suffixes(host).any(|suffix| self.hashes.contains(&hash_domain(suffix)))
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Approximate memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.hashes.capacity() * std::mem::size_of::<u64>()
    }
}

#[derive(Default)]
pub struct SafeBrowsingMatcher {
    domains: RuleSetCell<BadDomainSet>,
}

impl SafeBrowsingMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, set: BadDomainSet) -> u64 {
        let count = set.len();
        let memory = set.memory_usage();
        let version = self.domains.publish(set);
        info!(
            "Safe browsing set loaded: {} domains, ~{} KB (v{})",
            count,
            memory / 1024,
            version
        );
        version
    }

    pub fn load_str(&self, content: &str) -> u64 {
        self.load(BadDomainSet::parse(content))
    }

    pub fn unload(&self) {
        self.domains.unload();
    }
}

impl Matcher for SafeBrowsingMatcher {
    fn kind(&self) -> MatcherKind {
        MatcherKind::SafeBrowsing
    }

    fn is_loaded(&self) -> bool {
        self.domains.is_loaded()
    }

    fn query(
        &self,
        url: &Url,
        _page_domain: &str,
        _accept: Option<&str>,
    ) -> Result<MatchResult, ShieldError> {
        let Some(set) = self.domains.load() else {
            return Ok(MatchResult::no_match(MatcherKind::SafeBrowsing));
        };

        let host = url.host_str().unwrap_or_default();
        if !host.is_empty() && set.contains_host(host) {
            debug!("Safe browsing match: {}", host);
            return Ok(MatchResult::matched(MatcherKind::SafeBrowsing));
        }

        Ok(MatchResult::no_match(MatcherKind::SafeBrowsing))
    }
}

#[inline]
fn hash_domain(domain: &str) -> u64 {
    xxh3_64(domain.as_bytes())
}
