//! Matchers
//!
//! Each matcher wraps one independently loaded rule set and answers
//! "does this request match" (or "what is the rewritten URL").
//!
//! Rule sets live behind a `RuleSetCell`: reload publishes a new immutable
//! snapshot with a single atomic pointer swap, so in-flight queries keep
//! the snapshot they loaded and never see a half-built one. An empty cell
//! means "not loaded yet" and every query fails open.

mod adblock;
mod filter_list;
mod https;
mod safe_browsing;
mod tracking;

pub use adblock::AdBlockMatcher;
pub use filter_list::{FilterAction, FilterList, FilterListError, FilterRule, RuleOptions, RuleType};
pub use https::{HttpsRules, HttpsUpgradeMatcher};
pub use safe_browsing::{BadDomainSet, SafeBrowsingMatcher};
pub use tracking::{TrackerList, TrackingProtectionMatcher};

use crate::error::ShieldError;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Which shield a matcher (or a block) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatcherKind {
    AdBlock,
    TrackingProtection,
    SafeBrowsing,
    HttpsUpgrade,
    /// Script blocking; a heuristic, not backed by a rule set
    Script,
}

impl fmt::Display for MatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AdBlock => "ad-block",
            Self::TrackingProtection => "tracking-protection",
            Self::SafeBrowsing => "safe-browsing",
            Self::HttpsUpgrade => "https-upgrade",
            Self::Script => "script",
        };
        f.write_str(name)
    }
}

/// Result of one matcher query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    /// Only set by rewriting matchers
    pub rewritten_url: Option<Url>,
    pub category: MatcherKind,
}

impl MatchResult {
    pub fn no_match(category: MatcherKind) -> Self {
        Self {
            matched: false,
            rewritten_url: None,
            category,
        }
    }

    pub fn matched(category: MatcherKind) -> Self {
        Self {
            matched: true,
            rewritten_url: None,
            category,
        }
    }

    pub fn rewrite(category: MatcherKind, url: Url) -> Self {
        Self {
            matched: true,
            rewritten_url: Some(url),
            category,
        }
    }
}

/// The query contract shared by every matcher.
///
/// Implementations must be cheap and non-blocking: they run on the request
/// decision path and only ever read already-loaded in-memory state.
pub trait Matcher: Send + Sync {
    fn kind(&self) -> MatcherKind;

    fn is_loaded(&self) -> bool;

    /// Query with the page's normalized domain and the request's `Accept`
    /// header. An unloaded matcher returns `Ok` with `matched = false`.
    fn query(
        &self,
        url: &Url,
        page_domain: &str,
        accept: Option<&str>,
    ) -> Result<MatchResult, ShieldError>;
}

/// Atomically swappable, immutable rule-set snapshot
pub struct RuleSetCell<T> {
    current: ArcSwapOption<T>,
    version: AtomicU64,
}

impl<T> RuleSetCell<T> {
    /// Create an empty (not loaded) cell
    pub fn empty() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            version: AtomicU64::new(0),
        }
    }

    /// Current snapshot, if any
    #[inline]
    pub fn load(&self) -> Option<Arc<T>> {
        self.current.load_full()
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }

    /// Publish a new snapshot, returning its version
    pub fn publish(&self, rules: T) -> u64 {
        self.current.store(Some(Arc::new(rules)));
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop the current snapshot; the matcher fails open afterwards
    pub fn unload(&self) {
        self.current.store(None);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of publish/unload operations so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl<T> Default for RuleSetCell<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Document,
    Stylesheet,
    Script,
    Image,
    Font,
    XmlHttpRequest,
    Media,
    Other,
}

impl ResourceType {
    /// Guess from the URL path extension, falling back to the Accept header
    pub fn from_accept_or_path(accept: Option<&str>, path: &str) -> Self {
        let path = path.to_ascii_lowercase();

        if path.ends_with(".js") || path.ends_with(".mjs") { return Self::Script; }
        if path.ends_with(".css") { return Self::Stylesheet; }
        if path.ends_with(".woff") || path.ends_with(".woff2") || path.ends_with(".ttf") {
            return Self::Font;
        }
        if path.ends_with(".png") || path.ends_with(".jpg") ||
           path.ends_with(".jpeg") || path.ends_with(".gif") ||
           path.ends_with(".webp") || path.ends_with(".svg") {
            return Self::Image;
        }
        if path.ends_with(".mp4") || path.ends_with(".webm") ||
           path.ends_with(".mp3") || path.ends_with(".ogg") {
            return Self::Media;
        }

        if let Some(accept) = accept {
            let accept = accept.to_ascii_lowercase();
            if accept.contains("text/html") { return Self::Document; }
            if accept.contains("text/css") { return Self::Stylesheet; }
            if accept.contains("javascript") || accept.contains("ecmascript") { return Self::Script; }
            if accept.contains("image/") { return Self::Image; }
            if accept.contains("font/") { return Self::Font; }
            if accept.contains("application/json") { return Self::XmlHttpRequest; }
        }

        Self::Other
    }

    /// Name used by the `$type` filter options
    pub fn from_option(name: &str) -> Option<Self> {
        match name {
            "document" => Some(Self::Document),
            "stylesheet" => Some(Self::Stylesheet),
            "script" => Some(Self::Script),
            "image" => Some(Self::Image),
            "font" => Some(Self::Font),
            "xmlhttprequest" | "xhr" => Some(Self::XmlHttpRequest),
            "media" => Some(Self::Media),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Lines of a plain domain list: comments (`#`, `!`) and blanks skipped,
/// hosts-file lines (`0.0.0.0 host`) reduced to the host.
pub(crate) fn domain_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            return None;
        }
        let host = line.split_whitespace().last()?;
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        (!host.is_empty()).then_some(host)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_detection() {
        assert_eq!(
            ResourceType::from_accept_or_path(None, "/script.js"),
            ResourceType::Script
        );
        assert_eq!(
            ResourceType::from_accept_or_path(None, "/style.css"),
            ResourceType::Stylesheet
        );
        assert_eq!(
            ResourceType::from_accept_or_path(None, "/image.PNG"),
            ResourceType::Image
        );
        assert_eq!(
            ResourceType::from_accept_or_path(Some("text/html,application/xhtml+xml"), "/page"),
            ResourceType::Document
        );
        assert_eq!(
            ResourceType::from_accept_or_path(Some("*/*"), "/page"),
            ResourceType::Other
        );
    }

    #[test]
    fn test_rule_set_cell_swap() {
        let cell: RuleSetCell<Vec<u32>> = RuleSetCell::empty();
        assert!(!cell.is_loaded());
        assert!(cell.load().is_none());

        let v1 = cell.publish(vec![1]);
        let held = cell.load().unwrap();
        let v2 = cell.publish(vec![2, 3]);

        assert!(v2 > v1);
        // A reader that loaded before the swap keeps its own snapshot
        assert_eq!(*held, vec![1]);
        assert_eq!(*cell.load().unwrap(), vec![2, 3]);

        cell.unload();
        assert!(!cell.is_loaded());
    }

    #[test]
    fn test_domain_lines() {
        let content = "# comment\n0.0.0.0 Tracker.COM\n\nads.example.net.\n! other\n";
        let hosts: Vec<_> = domain_lines(content).collect();
        assert_eq!(hosts, vec!["tracker.com", "ads.example.net"]);
    }
}
