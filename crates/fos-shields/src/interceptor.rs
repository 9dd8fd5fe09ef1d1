//! Request Interceptor
//!
//! Every network load of a page passes through `classify`, synchronously,
//! before the transport acts on it.
//!
//! Flow:
//! 1. Non-http(s) scheme → Allow (not ours)
//! 2. Already handled (marker set on a redirected/cloned request) → Allow
//! 3. Resolve the page's `EffectivePolicy`; `all_off` → Allow. Site fixes
//!    run here when ad-block/TP is on
//! 4. HTTPS upgrade → Redirect (a navigation when it is the main document)
//! 5. Safe browsing → BlockPage (explanation only for the main frame)
//! 6. Tracking protection or ad-block → BlockEmpty (pixel for some hosts)
//! 7. Script blocking → BlockEmpty for scripts, StripScript for the rest
//! 8. Allow
//!
//! Steps 4-6 go through the session's `DecisionCache`. Nothing in here
//! returns an error: every failure has a fail-open default and is logged.

use crate::cache::{CacheKey, Decision};
use crate::compat::SiteFixes;
use crate::config::AdBlockException;
use crate::domain::{host_matches_suffix, normalized_domain};
use crate::error::ShieldError;
use crate::matcher::{
    AdBlockMatcher, HttpsUpgradeMatcher, MatchResult, Matcher, MatcherKind, ResourceType,
    SafeBrowsingMatcher, TrackingProtectionMatcher,
};
use crate::policy::{EffectivePolicy, ShieldPolicy};
use crate::response::{self, SyntheticResponse};
use crate::session::PageSession;
use crate::stats::StatCategory;
use hyper::Method;
use hyper::header::{ACCEPT, HeaderMap, HeaderValue};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

/// One outgoing request, as seen by the transport
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    pub method: Method,
    pub url: String,
    /// URL of the page's main document, if known
    pub main_document_url: Option<String>,
    pub headers: HeaderMap,
    /// Set by the transport on requests it re-issues after a verdict
    pub handled: bool,
}

impl InterceptRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            main_document_url: None,
            headers: HeaderMap::new(),
            handled: false,
        }
    }

    pub fn with_main_document(mut self, url: impl Into<String>) -> Self {
        self.main_document_url = Some(url.into());
        self
    }

    /// Set the Accept header; ignored if it is not a valid header value
    pub fn with_accept(mut self, accept: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(accept) {
            self.headers.insert(ACCEPT, value);
        }
        self
    }

    /// Mark as already processed
    pub fn mark_handled(mut self) -> Self {
        self.handled = true;
        self
    }

    fn accept(&self) -> Option<&str> {
        self.headers.get(ACCEPT).and_then(|v| v.to_str().ok())
    }
}

/// Body served for a silently blocked request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockBody {
    Empty,
    TransparentPixel,
}

/// How the transport should carry out a redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// Load the new URL in place of the request
    Substitute,
    /// Main document: navigate the view so the address bar shows it
    Navigate,
}

/// Outcome of classifying one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    BlockEmpty(BlockBody),
    /// Safe-browsing block; the page to show, empty for sub-resources
    BlockPage(String),
    Redirect { to: Url, mode: RedirectMode },
    /// Allow, but apply these headers to the response
    StripScript(HeaderMap),
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::BlockEmpty(_) => "block-empty",
            Self::BlockPage(_) => "block-page",
            Self::Redirect { .. } => "redirect",
            Self::StripScript(_) => "strip-script",
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Body to serve instead of going to the network
    pub fn synthetic_response(&self) -> Option<SyntheticResponse> {
        match self {
            Self::BlockEmpty(BlockBody::Empty) => Some(response::empty_response()),
            Self::BlockEmpty(BlockBody::TransparentPixel) => Some(response::transparent_pixel()),
            Self::BlockPage(html) => Some(response::blocked_page(html)),
            _ => None,
        }
    }

    /// Apply `StripScript` header overrides to a real response
    pub fn apply_to_response_headers(&self, headers: &mut HeaderMap) {
        if let Self::StripScript(overrides) = self {
            for (name, value) in overrides {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockEmpty(BlockBody::TransparentPixel) => write!(f, "block-empty (pixel)"),
            Self::Redirect { to, mode } => write!(f, "redirect {:?} -> {}", mode, to),
            other => f.write_str(other.label()),
        }
    }
}

/// The matchers, injected so tests can substitute fakes
#[derive(Clone)]
pub struct MatcherSet {
    pub https_upgrade: Arc<dyn Matcher>,
    pub safe_browsing: Arc<dyn Matcher>,
    pub tracking_protection: Arc<dyn Matcher>,
    pub ad_block: Arc<dyn Matcher>,
}

impl MatcherSet {
    /// Empty real matchers; every one fails open until loaded
    pub fn unloaded() -> Self {
        Self {
            https_upgrade: Arc::new(HttpsUpgradeMatcher::new()),
            safe_browsing: Arc::new(SafeBrowsingMatcher::new()),
            tracking_protection: Arc::new(TrackingProtectionMatcher::new()),
            ad_block: Arc::new(AdBlockMatcher::new()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Matcher>> {
        [
            &self.https_upgrade,
            &self.safe_browsing,
            &self.tracking_protection,
            &self.ad_block,
        ]
        .into_iter()
    }
}

/// Interception statistics
#[derive(Debug, Default)]
pub struct InterceptorStats {
    pub total_requests: AtomicU64,
    pub intercepted_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub matcher_failures: AtomicU64,
    pub stale_decisions: AtomicU64,
    pub total_check_time_ns: AtomicU64,
}

pub struct RequestInterceptor {
    policy: Arc<ShieldPolicy>,
    matchers: MatcherSet,
    site_fixes: Option<Arc<SiteFixes>>,
    adblock_exceptions: Vec<AdBlockException>,
    pixel_hosts: Vec<String>,
    internal_hosts: Vec<String>,
    /// Bumped whenever a cached decision could have become wrong
    epoch: AtomicU64,
    stats: InterceptorStats,
}

impl RequestInterceptor {
    pub fn new(policy: Arc<ShieldPolicy>, matchers: MatcherSet) -> Self {
        Self {
            policy,
            matchers,
            site_fixes: None,
            adblock_exceptions: Vec::new(),
            pixel_hosts: Vec::new(),
            internal_hosts: Vec::new(),
            epoch: AtomicU64::new(0),
            stats: InterceptorStats::default(),
        }
    }

    pub fn with_site_fixes(mut self, fixes: Arc<SiteFixes>) -> Self {
        self.site_fixes = Some(fixes);
        self
    }

    pub fn with_adblock_exceptions(mut self, exceptions: Vec<AdBlockException>) -> Self {
        self.adblock_exceptions = exceptions;
        self
    }

    pub fn with_pixel_hosts(mut self, hosts: Vec<String>) -> Self {
        self.pixel_hosts = hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_internal_hosts(mut self, hosts: Vec<String>) -> Self {
        self.internal_hosts = hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }

    pub fn policy(&self) -> &Arc<ShieldPolicy> {
        &self.policy
    }

    pub fn matchers(&self) -> &MatcherSet {
        &self.matchers
    }

    /// Make every cached decision stale (policy, defaults or lists changed)
    pub fn invalidate_decisions(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Decision epoch now {}", epoch);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Classify one request of `session`'s page.
    ///
    /// This is the hot path: it reads in-memory state only.
    pub fn classify(&self, session: &PageSession, request: &InterceptRequest) -> Verdict {
        let start = Instant::now();
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let verdict = self.evaluate(session, request);

        let elapsed = start.elapsed().as_nanos() as u64;
        self.stats.total_check_time_ns.fetch_add(elapsed, Ordering::Relaxed);
        if !verdict.is_allow() {
            self.stats.intercepted_requests.fetch_add(1, Ordering::Relaxed);
        }
        trace!("{} {} -> {} ({} ns)", request.method, request.url, verdict, elapsed);

        verdict
    }

    /// Whether the page open in `session` should get fingerprint protection
    pub fn fingerprint_protection_enabled(&self, session: &PageSession) -> bool {
        match session.page_domain() {
            Some(domain) => self.policy.resolve(&domain).fingerprint_protection,
            None => self.policy.defaults().fingerprint_protection,
        }
    }

    fn evaluate(&self, session: &PageSession, request: &InterceptRequest) -> Verdict {
        let url = match Url::parse(&request.url) {
            Ok(url) => url,
            Err(e) => {
                let error = ShieldError::MalformedUrl {
                    url: request.url.clone(),
                    reason: e.to_string(),
                };
                warn!("{}", error);
                return Verdict::Allow;
            }
        };

        // 1. Only web traffic
        if !matches!(url.scheme(), "http" | "https") {
            return Verdict::Allow;
        }

        // 2. Re-issued request
        if request.handled {
            return Verdict::Allow;
        }

        let generation = session.generation();
        let main_document = request
            .main_document_url
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok());

        if self.is_internal(&url) || main_document.as_ref().is_some_and(|doc| self.is_internal(doc)) {
            return Verdict::Allow;
        }

        // 3. Policy for the page, not for the request's own host
        let page_domain = main_document
            .as_ref()
            .and_then(normalized_domain)
            .or_else(|| session.page_domain())
            .or_else(|| normalized_domain(&url))
            .unwrap_or_default();

        // Read before the policy: a racing toggle leaves a stale entry only
        let epoch = self.epoch();
        let policy = self.policy.resolve(&page_domain);
        if policy.all_off {
            trace!("Shields off for '{}'", page_domain);
            return Verdict::Allow;
        }

        // Site fixes belong to ad-block/TP
        if policy.ad_block_and_tp {
            if let Some(fixes) = &self.site_fixes {
                fixes.apply(session.id(), &url);
            }
        }

        let accept = request.accept();
        let resource_type = ResourceType::from_accept_or_path(accept, url.path());
        let is_main_frame = main_document.as_ref() == Some(&url);

        // 4-6. Matchers, memoized per page
        let key = CacheKey::new(&page_domain, &url, resource_type, epoch);
        let decision = match session.cache().get(&key) {
            Some(decision) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                decision
            }
            None => {
                let decision = self.decide(&policy, &url, &page_domain, accept);
                if !session.cache_decision(generation, key, decision.clone()) {
                    self.stats.stale_decisions.fetch_add(1, Ordering::Relaxed);
                }
                decision
            }
        };

        let (verdict, category) =
            self.materialize(decision, &url, is_main_frame, &policy, resource_type);

        if let Some(category) = category {
            if !session.record(generation, category) {
                debug!("Discarding stale {} count for {}", category, url);
            }
        }

        verdict
    }

    /// Steps 4-6: the matcher stage, independent of the request's context
    fn decide(
        &self,
        policy: &EffectivePolicy,
        url: &Url,
        page_domain: &str,
        accept: Option<&str>,
    ) -> Decision {
        if policy.https_upgrade && url.scheme() == "http" {
            if let Some(MatchResult {
                matched: true,
                rewritten_url: Some(to),
                ..
            }) = self.query(&self.matchers.https_upgrade, url, page_domain, accept)
            {
                return Decision::Upgrade(to);
            }
        }

        if policy.safe_browsing && self.matches(&self.matchers.safe_browsing, url, page_domain, accept) {
            return Decision::Blocked(MatcherKind::SafeBrowsing);
        }

        if policy.ad_block_and_tp {
            if self.matches(&self.matchers.tracking_protection, url, page_domain, accept) {
                return Decision::Blocked(MatcherKind::TrackingProtection);
            }

            let excepted = self
                .adblock_exceptions
                .iter()
                .any(|e| e.applies(page_domain, url.as_str()));
            if !excepted && self.matches(&self.matchers.ad_block, url, page_domain, accept) {
                return Decision::Blocked(MatcherKind::AdBlock);
            }
        }

        Decision::Allow
    }

    /// Turn a decision into this request's verdict; step 7 lives here
    fn materialize(
        &self,
        decision: Decision,
        url: &Url,
        is_main_frame: bool,
        policy: &EffectivePolicy,
        resource_type: ResourceType,
    ) -> (Verdict, Option<StatCategory>) {
        match decision {
            Decision::Upgrade(to) => {
                let mode = if is_main_frame {
                    RedirectMode::Navigate
                } else {
                    RedirectMode::Substitute
                };
                (Verdict::Redirect { to, mode }, Some(StatCategory::HttpsUpgrade))
            }
            Decision::Blocked(MatcherKind::SafeBrowsing) => {
                // Sub-resources are blocked too, but get no page to show
                let html = if is_main_frame {
                    response::blocked_page_html(url.as_str())
                } else {
                    String::new()
                };
                (Verdict::BlockPage(html), Some(StatCategory::SafeBrowsing))
            }
            Decision::Blocked(kind) => {
                let body = if self.wants_pixel(url) {
                    BlockBody::TransparentPixel
                } else {
                    BlockBody::Empty
                };
                (Verdict::BlockEmpty(body), Some(kind.into()))
            }
            Decision::Allow if policy.no_script => {
                if resource_type == ResourceType::Script {
                    (
                        Verdict::BlockEmpty(BlockBody::Empty),
                        Some(StatCategory::ScriptBlocking),
                    )
                } else {
                    let mut headers = HeaderMap::new();
                    response::apply_script_csp(&mut headers);
                    (Verdict::StripScript(headers), None)
                }
            }
            Decision::Allow => (Verdict::Allow, None),
        }
    }

    fn matches(&self, matcher: &Arc<dyn Matcher>, url: &Url, page_domain: &str, accept: Option<&str>) -> bool {
        self.query(matcher, url, page_domain, accept)
            .is_some_and(|result| result.matched)
    }

    /// Query one matcher; unavailable or failing matchers count as no match
    fn query(
        &self,
        matcher: &Arc<dyn Matcher>,
        url: &Url,
        page_domain: &str,
        accept: Option<&str>,
    ) -> Option<MatchResult> {
        if !matcher.is_loaded() {
            trace!("{}", ShieldError::MatcherUnavailable(matcher.kind()));
            return None;
        }

        match matcher.query(url, page_domain, accept) {
            Ok(result) => Some(result),
            Err(e) => {
                self.stats.matcher_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{}", e);
                None
            }
        }
    }

    fn wants_pixel(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default();
        self.pixel_hosts.iter().any(|p| host_matches_suffix(host, p))
    }

    fn is_internal(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.internal_hosts.iter().any(|h| h == host))
    }

    /// (total, intercepted, cache hits, matcher failures)
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.total_requests.load(Ordering::Relaxed),
            self.stats.intercepted_requests.load(Ordering::Relaxed),
            self.stats.cache_hits.load(Ordering::Relaxed),
            self.stats.matcher_failures.load(Ordering::Relaxed),
        )
    }

    /// Decisions computed for a page that had already been left
    pub fn stale_decisions(&self) -> u64 {
        self.stats.stale_decisions.load(Ordering::Relaxed)
    }

    /// Get average check time in nanoseconds
    pub fn avg_check_time_ns(&self) -> u64 {
        let total = self.stats.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.stats.total_check_time_ns.load(Ordering::Relaxed) / total
    }
}
