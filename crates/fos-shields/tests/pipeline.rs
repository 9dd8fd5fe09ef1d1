//! End-to-end behaviour of the shield pipeline.

use fos_shields::matcher::{AdBlockMatcher, HttpsUpgradeMatcher, SafeBrowsingMatcher};
use fos_shields::{
    BlockBody, CacheConfig, GlobalDefaults, HostAction, InterceptRequest, LoopGuard, MatchResult,
    Matcher, MatcherKind, MatcherSet, PageSession, RedirectMode, RequestInterceptor, SessionId,
    Shield, ShieldError, ShieldPolicy, ShieldStateService, Shields, ShieldsConfig, Verdict,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use url::Url;

/// Matcher with scripted answers
#[derive(Default)]
struct FakeMatcher {
    kind: Option<MatcherKind>,
    loaded: bool,
    hosts: Vec<String>,
    fail: bool,
    queries: AtomicUsize,
    /// Navigated to a new page while the query runs
    navigate_during_query: OnceLock<Arc<PageSession>>,
}

impl FakeMatcher {
    fn matching(kind: MatcherKind, hosts: &[&str]) -> Self {
        Self {
            kind: Some(kind),
            loaded: true,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Self::default()
        }
    }

    fn failing(kind: MatcherKind) -> Self {
        Self {
            kind: Some(kind),
            loaded: true,
            fail: true,
            ..Self::default()
        }
    }

    fn unloaded(kind: MatcherKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }
}

impl Matcher for FakeMatcher {
    fn kind(&self) -> MatcherKind {
        self.kind.unwrap_or(MatcherKind::AdBlock)
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn query(&self, url: &Url, _page: &str, _accept: Option<&str>) -> Result<MatchResult, ShieldError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.navigate_during_query.get() {
            session.on_main_frame_navigation_start("elsewhere.example");
        }
        if !self.loaded {
            return Ok(MatchResult::no_match(self.kind()));
        }
        if self.fail {
            return Err(ShieldError::MatcherFailed {
                kind: self.kind(),
                url: url.to_string(),
                reason: "corrupt rule".to_string(),
            });
        }

        let host = url.host_str().unwrap_or_default();
        if !self.hosts.iter().any(|h| h == host) {
            return Ok(MatchResult::no_match(self.kind()));
        }
        if self.kind() == MatcherKind::HttpsUpgrade {
            if url.scheme() != "http" {
                return Ok(MatchResult::no_match(self.kind()));
            }
            let mut upgraded = url.clone();
            upgraded.set_scheme("https").unwrap();
            return Ok(MatchResult::rewrite(self.kind(), upgraded));
        }
        Ok(MatchResult::matched(self.kind()))
    }
}

struct Pipeline {
    state: Arc<ShieldStateService>,
    interceptor: RequestInterceptor,
}

fn pipeline(matchers: MatcherSet) -> Pipeline {
    let state = Arc::new(ShieldStateService::in_memory().unwrap());
    let policy = Arc::new(ShieldPolicy::new(GlobalDefaults::default(), state.clone()));
    Pipeline {
        state,
        interceptor: RequestInterceptor::new(policy, matchers),
    }
}

fn all_matching(hosts: &[&str]) -> MatcherSet {
    MatcherSet {
        https_upgrade: Arc::new(FakeMatcher::matching(MatcherKind::HttpsUpgrade, hosts)),
        safe_browsing: Arc::new(FakeMatcher::matching(MatcherKind::SafeBrowsing, hosts)),
        tracking_protection: Arc::new(FakeMatcher::matching(MatcherKind::TrackingProtection, hosts)),
        ad_block: Arc::new(FakeMatcher::matching(MatcherKind::AdBlock, hosts)),
    }
}

fn session_on(domain: &str) -> PageSession {
    let session = PageSession::new(SessionId(1), CacheConfig::default());
    session.on_main_frame_navigation_start(domain);
    session
}

fn on_page(page: &str, url: &str) -> InterceptRequest {
    InterceptRequest::get(url).with_main_document(page)
}

#[test]
fn scenario_a_ad_block_with_default_policy() {
    let ads = AdBlockMatcher::new();
    ads.load_str("easylist", "||ads.tracker.io^\n").unwrap();
    let matchers = MatcherSet {
        ad_block: Arc::new(ads),
        ..MatcherSet::unloaded()
    };
    let p = pipeline(matchers);
    let session = session_on("example.com");

    assert!(p.state.get("example.com").is_default());
    let verdict = p
        .interceptor
        .classify(&session, &on_page("https://example.com/", "https://ads.tracker.io/banner.js"));

    assert_eq!(verdict, Verdict::BlockEmpty(BlockBody::Empty));
    let stats = session.stats_snapshot();
    assert_eq!(stats.ad_block_and_tp, 1);
    assert_eq!(stats.total(), 1);
}

#[test]
fn scenario_b_https_upgrade_redirect() {
    let https = HttpsUpgradeMatcher::new();
    https.load_str("example.com");
    let matchers = MatcherSet {
        https_upgrade: Arc::new(https),
        ..MatcherSet::unloaded()
    };
    let p = pipeline(matchers);
    p.state.set_shield("example.com", Shield::HttpsUpgrade, Some(true));
    let session = session_on("example.com");

    let verdict = p
        .interceptor
        .classify(&session, &on_page("http://example.com/", "http://example.com/"));

    match verdict {
        Verdict::Redirect { to, mode } => {
            assert_eq!(to.as_str(), "https://example.com/");
            assert_eq!(mode, RedirectMode::Navigate);
        }
        other => panic!("expected redirect, got {:?}", other),
    }
    assert_eq!(session.stats_snapshot().https_upgrade, 1);
}

#[test]
fn scenario_c_all_off_allows_everything() {
    let p = pipeline(all_matching(&["example.com", "ads.example.com"]));
    p.state.set_all_off("example.com", true);
    let session = session_on("example.com");

    for url in ["http://example.com/", "https://ads.example.com/a.js", "http://ads.example.com/x.gif"] {
        assert_eq!(
            p.interceptor.classify(&session, &on_page("http://example.com/", url)),
            Verdict::Allow
        );
    }
    assert!(session.stats_snapshot().is_zero());
}

#[test]
fn scenario_d_navigation_clears_cache_and_stats() {
    let p = pipeline(all_matching(&["ads.net"]));
    let session = session_on("news.example");

    for n in 0..5 {
        let url = format!("https://ads.net/{}.gif", n);
        p.interceptor.classify(&session, &on_page("https://news.example/", &url));
    }
    assert_eq!(session.cache().len(), 5);
    assert!(!session.stats_snapshot().is_zero());

    session.on_main_frame_navigation_start("news.example");

    assert_eq!(session.cache().len(), 0);
    assert!(session.stats_snapshot().is_zero());
    assert!(session.stats_snapshot().as_map().values().all(|&count| count == 0));
}

#[test]
fn https_upgrade_never_rewrites_twice() {
    let https = HttpsUpgradeMatcher::new();
    https.load_str("example.com\n*.example.org\nplain.net\n");

    let urls = [
        "http://example.com/",
        "https://example.com/",
        "http://a.example.org/path?q=1",
        "http://plain.net:8080/",
        "http://unknown.io/",
        "ftp://example.com/file",
    ];
    for raw in urls {
        let url = Url::parse(raw).unwrap();
        let first = https.query(&url, "", None).unwrap();
        let next = first.rewritten_url.unwrap_or(url);
        let second = https.query(&next, "", None).unwrap();
        assert!(second.rewritten_url.is_none(), "{} upgraded twice", raw);
    }
}

#[test]
fn all_off_wins_over_every_shield() {
    let p = pipeline(all_matching(&["evil.com", "a.evil.com"]));
    for shield in Shield::ALL {
        p.state.set_shield("evil.com", shield, Some(true));
    }
    p.state.set_all_off("www.evil.com", true);
    let session = session_on("evil.com");

    for url in ["http://evil.com/", "https://a.evil.com/app.js", "https://evil.com/page"] {
        let request = on_page("https://evil.com/", url);
        assert_eq!(p.interceptor.classify(&session, &request), Verdict::Allow);
    }
}

#[test]
fn safe_browsing_outranks_ad_block() {
    let p = pipeline(MatcherSet {
        safe_browsing: Arc::new(FakeMatcher::matching(MatcherKind::SafeBrowsing, &["bad.io"])),
        ad_block: Arc::new(FakeMatcher::matching(MatcherKind::AdBlock, &["bad.io"])),
        ..MatcherSet::unloaded()
    });
    let session = session_on("news.org");

    let main = p
        .interceptor
        .classify(&session, &on_page("https://bad.io/", "https://bad.io/"));
    assert!(matches!(&main, Verdict::BlockPage(html) if html.contains("bad.io")));

    let sub = p
        .interceptor
        .classify(&session, &on_page("https://news.org/", "https://bad.io/ad.js"));
    assert!(matches!(sub, Verdict::BlockPage(_)));

    let stats = session.stats_snapshot();
    assert_eq!(stats.safe_browsing, 2);
    assert_eq!(stats.ad_block_and_tp, 0);
}

#[test]
fn cached_verdicts_match_uncached() {
    let https = HttpsUpgradeMatcher::new();
    https.load_str("cdn.example");
    let ads = AdBlockMatcher::new();
    ads.load_str("list", "||ads.net^\n/track/*$image\n").unwrap();
    let p = pipeline(MatcherSet {
        https_upgrade: Arc::new(https),
        ad_block: Arc::new(ads),
        ..MatcherSet::unloaded()
    });
    p.state.set_shield("news.org", Shield::NoScript, Some(true));

    let cached = session_on("news.org");
    let uncached = PageSession::new(SessionId(2), CacheConfig { capacity: 0 });
    uncached.on_main_frame_navigation_start("news.org");

    let requests = [
        on_page("https://news.org/", "https://ads.net/a.js"),
        on_page("https://news.org/", "http://cdn.example/lib.css"),
        on_page("https://news.org/", "https://img.org/track/1.png"),
        on_page("https://news.org/", "https://img.org/track/1.png").with_accept("text/html"),
        on_page("https://news.org/", "https://news.org/app.js"),
        on_page("https://news.org/", "https://news.org/"),
        on_page("http://cdn.example/", "http://cdn.example/"),
    ];

    for round in 0..2 {
        for request in &requests {
            let with_cache = p.interceptor.classify(&cached, request);
            let without = p.interceptor.classify(&uncached, request);
            assert_eq!(with_cache, without, "round {} {}", round, request.url);
        }
    }
    assert!(p.interceptor.stats().2 > 0);
    assert_eq!(uncached.cache().len(), 0);
}

#[test]
fn loop_guard_trips_only_above_threshold() {
    for threshold in 1..=5u32 {
        let guard = LoopGuard::new(Duration::from_secs(10), threshold);
        let start = Instant::now();

        for n in 0..threshold {
            guard.increment_at("p", start + Duration::from_millis(n as u64));
            assert!(!guard.is_looping_at("p", start + Duration::from_millis(n as u64)));
        }

        guard.increment_at("p", start + Duration::from_secs(1));
        assert!(guard.is_looping_at("p", start + Duration::from_secs(1)));
        assert!(!guard.is_looping_at("p", start + Duration::from_secs(11)));
    }
}

#[test]
fn unloaded_matchers_never_match() {
    let matchers: Vec<Arc<dyn Matcher>> = vec![
        Arc::new(AdBlockMatcher::new()),
        Arc::new(SafeBrowsingMatcher::new()),
        Arc::new(HttpsUpgradeMatcher::new()),
        Arc::new(fos_shields::TrackingProtectionMatcher::new()),
    ];

    for matcher in &matchers {
        assert!(!matcher.is_loaded());
        for raw in ["http://ads.example/a.js", "https://evil.com/", "http://example.com:81/x"] {
            let url = Url::parse(raw).unwrap();
            for page in ["", "news.org", "evil.com"] {
                let result = matcher.query(&url, page, Some("*/*")).unwrap();
                assert!(!result.matched);
                assert!(result.rewritten_url.is_none());
            }
        }
    }
}

#[test]
fn failing_matcher_does_not_stop_the_others() {
    let tracking = Arc::new(FakeMatcher::matching(MatcherKind::TrackingProtection, &["t.io"]));
    let p = pipeline(MatcherSet {
        safe_browsing: Arc::new(FakeMatcher::failing(MatcherKind::SafeBrowsing)),
        tracking_protection: tracking.clone(),
        https_upgrade: Arc::new(FakeMatcher::unloaded(MatcherKind::HttpsUpgrade)),
        ad_block: Arc::new(FakeMatcher::failing(MatcherKind::AdBlock)),
    });
    let session = session_on("news.org");

    let blocked = p
        .interceptor
        .classify(&session, &on_page("https://news.org/", "https://t.io/p.gif"));
    assert_eq!(blocked, Verdict::BlockEmpty(BlockBody::Empty));

    let allowed = p
        .interceptor
        .classify(&session, &on_page("https://news.org/", "https://cdn.io/lib.js"));
    assert_eq!(allowed, Verdict::Allow);

    // safe browsing failed twice, ad-block once
    assert_eq!(p.interceptor.stats().3, 3);
    assert_eq!(tracking.queries.load(Ordering::SeqCst), 2);
}

#[test]
fn superseded_navigation_discards_decision() {
    let ads = Arc::new(FakeMatcher::matching(MatcherKind::AdBlock, &["ads.net"]));
    let p = pipeline(MatcherSet {
        ad_block: ads.clone(),
        ..MatcherSet::unloaded()
    });
    let session = Arc::new(session_on("news.org"));
    let _ = ads.navigate_during_query.set(session.clone());

    let verdict = p
        .interceptor
        .classify(&session, &on_page("https://news.org/", "https://ads.net/a.js"));

    // The caller still gets an answer, but the new page inherits nothing
    assert_eq!(verdict, Verdict::BlockEmpty(BlockBody::Empty));
    assert_eq!(session.page_domain().as_deref(), Some("elsewhere.example"));
    assert!(session.cache().is_empty());
    assert!(session.stats_snapshot().is_zero());
    assert_eq!(p.interceptor.stale_decisions(), 1);
}

#[test]
fn concurrent_classification_during_reload() {
    let ads = Arc::new(AdBlockMatcher::new());
    ads.load_str("one", "||ads.one^\n").unwrap();
    let p = pipeline(MatcherSet {
        ad_block: ads.clone(),
        ..MatcherSet::unloaded()
    });
    let sessions: Vec<_> = (0..4)
        .map(|n| {
            let session = PageSession::new(SessionId(n), CacheConfig { capacity: 8 });
            session.on_main_frame_navigation_start("news.org");
            session
        })
        .collect();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for n in 0..50 {
                let content = if n % 2 == 0 { "||ads.two^\n" } else { "||ads.one^\n" };
                ads.load_str("swap", content).unwrap();
                p.interceptor.invalidate_decisions();
            }
        });

        for session in &sessions {
            let interceptor = &p.interceptor;
            scope.spawn(move || {
                for n in 0..200 {
                    let host = if n % 2 == 0 { "ads.one" } else { "ads.two" };
                    let url = format!("https://{}/{}.js", host, n % 10);
                    let verdict = interceptor.classify(session, &on_page("https://news.org/", &url));
                    assert!(matches!(
                        verdict,
                        Verdict::Allow | Verdict::BlockEmpty(BlockBody::Empty)
                    ));
                    let clean = interceptor.classify(session, &on_page("https://news.org/", "https://cdn.org/x.js"));
                    assert_eq!(clean, Verdict::Allow);
                }
                assert!(session.cache().len() <= 8);
            });
        }
    });

    let (total, ..) = p.interceptor.stats();
    assert_eq!(total, 4 * 200 * 2);
}

#[test]
fn site_fix_navigation_is_loop_guarded() {
    let shields = Shields::new(ShieldsConfig::default()).unwrap();
    let actions = shields.host_actions();
    let session = shields.new_session();
    shields.on_main_frame_navigation_start(&session, "www.forbes.com");

    let welcome = on_page("https://www.forbes.com/", "https://www.forbes.com/forbes/welcome/");
    for _ in 0..12 {
        assert_eq!(shields.classify(&session, &welcome), Verdict::Allow);
    }

    let received: Vec<_> = actions.try_iter().collect();
    let cookies = received
        .iter()
        .filter(|a| matches!(a, HostAction::SetCookie { .. }))
        .count();
    let navigations = received
        .iter()
        .filter(|a| matches!(a, HostAction::Navigate { url, .. } if url.as_str() == "http://www.forbes.com/"))
        .count();

    assert_eq!(cookies, 1);
    assert_eq!(navigations, 10);
}

#[test]
fn site_fixes_follow_ad_block_shield() {
    let welcome = on_page("https://www.forbes.com/", "https://www.forbes.com/forbes/welcome/");

    // All shields off for the site
    let shields = Shields::new(ShieldsConfig::default()).unwrap();
    shields.set_all_off("forbes.com", true);
    let session = shields.new_session();
    shields.on_main_frame_navigation_start(&session, "www.forbes.com");
    for _ in 0..3 {
        assert_eq!(shields.classify(&session, &welcome), Verdict::Allow);
    }
    assert_eq!(shields.host_actions().try_iter().count(), 0);

    // Only ad-block/TP off for the site
    let shields = Shields::new(ShieldsConfig::default()).unwrap();
    shields.set_shield("forbes.com", Shield::AdBlockAndTp, Some(false));
    let session = shields.new_session();
    shields.on_main_frame_navigation_start(&session, "www.forbes.com");
    for _ in 0..3 {
        assert_eq!(shields.classify(&session, &welcome), Verdict::Allow);
    }
    assert_eq!(shields.host_actions().try_iter().count(), 0);

    // Turning it back on brings the fix back
    shields.set_shield("forbes.com", Shield::AdBlockAndTp, None);
    shields.classify(&session, &welcome);
    assert!(shields
        .host_actions()
        .try_iter()
        .any(|a| matches!(a, HostAction::SetCookie { .. })));
}

#[test]
fn shield_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = ShieldsConfig {
        state_path: Some(dir.path().join("shields.json")),
        ..ShieldsConfig::default()
    };

    {
        let shields = Shields::new(config.clone()).unwrap();
        shields.set_shield("www.example.com", Shield::SafeBrowsing, Some(false));
        shields.set_all_off("news.org", true);
        shields.set_private_browsing(true);
        shields.set_shield("secret.org", Shield::NoScript, Some(true));
        shields.flush();
    }

    let shields = Shields::new(config).unwrap();
    assert!(!shields.effective_policy("example.com").safe_browsing);
    assert!(shields.effective_policy("news.org").all_off);
    assert!(shields.shield_state("secret.org").is_default());

    shields.clear_private_data();
    shields.flush();
    drop(shields);

    let content = std::fs::read_to_string(dir.path().join("shields.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(parsed, serde_json::json!({}));
}

#[test]
fn policy_write_is_seen_by_next_request() {
    let shields = Shields::new(ShieldsConfig::default()).unwrap();
    shields.load_ad_block_str("list", "||ads.net^").unwrap();
    let session = shields.new_session();
    shields.on_main_frame_navigation_start(&session, "news.org");

    let request = on_page("https://news.org/", "https://ads.net/a.js");
    assert!(matches!(shields.classify(&session, &request), Verdict::BlockEmpty(_)));

    shields.set_shield("news.org", Shield::AdBlockAndTp, Some(false));
    assert_eq!(shields.classify(&session, &request), Verdict::Allow);

    shields.set_shield("news.org", Shield::AdBlockAndTp, None);
    assert!(matches!(shields.classify(&session, &request), Verdict::BlockEmpty(_)));
    assert_eq!(shields.on_main_frame_navigation_end(&session).ad_block_and_tp, 2);
}
