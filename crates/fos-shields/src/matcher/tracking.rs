//! Tracking protection: a plain list of tracker domains.
//!
//! A request matches when its host, or any parent domain of it, is on the
//! list and the request is third-party to the page.

use super::{MatchResult, Matcher, MatcherKind, RuleSetCell, domain_lines};
use crate::domain::{host_suffixes, is_third_party};
use crate::error::ShieldError;
use std::collections::HashSet;
use tracing::{info, trace};
use url::Url;

/// Immutable set of tracker domains
#[derive(Debug, Default)]
pub struct TrackerList {
    domains: HashSet<String>,
}

impl TrackerList {
    /// Parse one domain per line (hosts-file lines accepted)
    pub fn parse(content: &str) -> Self {
        Self {
            domains: domain_lines(content).collect(),
        }
    }

    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Whether the host or one of its parents is a tracker
    pub fn contains_host(&self, host: &str) -> bool {
        host_suffixes(host).any(|suffix| self.domains.contains(suffix))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[derive(Default)]
pub struct TrackingProtectionMatcher {
    list: RuleSetCell<TrackerList>,
}

impl TrackingProtectionMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, list: TrackerList) -> u64 {
        let count = list.len();
        let version = self.list.publish(list);
        info!("Tracking protection list loaded: {} domains (v{})", count, version);
        version
    }

    pub fn load_str(&self, content: &str) -> u64 {
        self.load(TrackerList::parse(content))
    }

    pub fn unload(&self) {
        self.list.unload();
    }
}

impl Matcher for TrackingProtectionMatcher {
    fn kind(&self) -> MatcherKind {
        MatcherKind::TrackingProtection
    }

    fn is_loaded(&self) -> bool {
        self.list.is_loaded()
    }

    fn query(
        &self,
        url: &Url,
        page_domain: &str,
        _accept: Option<&str>,
    ) -> Result<MatchResult, ShieldError> {
        let Some(list) = self.list.load() else {
            return Ok(MatchResult::no_match(MatcherKind::TrackingProtection));
        };

        let host = url.host_str().unwrap_or_default();
        if is_third_party(host, page_domain) && list.contains_host(host) {
            trace!("Tracker match: {}", host);
            return Ok(MatchResult::matched(MatcherKind::TrackingProtection));
        }

        Ok(MatchResult::no_match(MatcherKind::TrackingProtection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(matcher: &TrackingProtectionMatcher, url: &str, page: &str) -> bool {
        let url = Url::parse(url).unwrap();
        matcher.query(&url, page, None).unwrap().matched
    }

    #[test]
    fn test_tracker_list() {
        let list = TrackerList::parse("# trackers\ntracker.com\n0.0.0.0 pixel.ads.net\n");
        assert_eq!(list.len(), 2);
        assert!(list.contains_host("tracker.com"));
        assert!(list.contains_host("a.b.tracker.com"));
        assert!(list.contains_host("pixel.ads.net"));
        assert!(!list.contains_host("ads.net"));
        assert!(!list.contains_host("nottracker.com"));
    }

    #[test]
    fn test_third_party_only() {
        let matcher = TrackingProtectionMatcher::new();
        matcher.load(TrackerList::from_domains(["tracker.com"]));

        assert!(matched(&matcher, "https://cdn.tracker.com/t.js", "news.org"));
        assert!(!matched(&matcher, "https://cdn.tracker.com/t.js", "tracker.com"));
    }

    #[test]
    fn test_unloaded_fails_open() {
        let matcher = TrackingProtectionMatcher::new();
        assert!(!matched(&matcher, "https://tracker.com/", "news.org"));

        matcher.load_str("tracker.com");
        matcher.unload();
        assert!(!matched(&matcher, "https://tracker.com/", "news.org"));
    }
}
