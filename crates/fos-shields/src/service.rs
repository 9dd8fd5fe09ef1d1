//! Shields Service
//!
//! Composition root: builds the state store, policy, matchers, site fixes
//! and interceptor from a `ShieldsConfig` and wires them together. The host
//! holds one `Shields` and one `PageSession` per tab; nothing is global.
//!
//! Every change that can make a cached decision wrong (shield toggles,
//! defaults, private mode, list reloads) bumps the interceptor's epoch.

use crate::compat::{HostAction, SiteFixes};
use crate::config::{ConfigError, ShieldsConfig};
use crate::interceptor::{InterceptRequest, MatcherSet, RequestInterceptor, Verdict};
use crate::loop_guard::LoopGuard;
use crate::matcher::{
    AdBlockMatcher, BadDomainSet, FilterList, FilterListError, HttpsRules, HttpsUpgradeMatcher,
    SafeBrowsingMatcher, TrackerList, TrackingProtectionMatcher,
};
use crate::policy::{EffectivePolicy, Shield, ShieldPolicy, ShieldState};
use crate::session::{PageSession, SessionId};
use crate::state_store::{JsonFileStateStore, MemoryStateStore, ShieldStateService, ShieldStateStore, StoreError};
use crate::domain::normalize_host;
use crate::stats::ShieldStats;
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::task;
use tracing::{info, warn};

/// Errors while setting up or reloading shields
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Shield state: {0}")]
    Store(#[from] StoreError),

    #[error("Filter list: {0}")]
    FilterList(#[from] FilterListError),

    #[error("Failed to read {path}: {source}")]
    ListRead {
        path: String,
        source: std::io::Error,
    },

    #[error("List parsing task failed: {0}")]
    Task(String),
}

/// Lists loaded by `load_lists`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListReport {
    pub ad_block_rules: Option<usize>,
    pub tracker_domains: Option<usize>,
    pub bad_domains: Option<usize>,
    pub https_rules: Option<usize>,
}

pub struct Shields {
    config: ShieldsConfig,
    state: Arc<ShieldStateService>,
    policy: Arc<ShieldPolicy>,
    interceptor: RequestInterceptor,
    ad_block: Arc<AdBlockMatcher>,
    tracking_protection: Arc<TrackingProtectionMatcher>,
    safe_browsing: Arc<SafeBrowsingMatcher>,
    https_upgrade: Arc<HttpsUpgradeMatcher>,
    host_actions: Receiver<HostAction>,
    next_session: AtomicU64,
}

impl Shields {
    /// Build everything from a validated configuration. Lists start
    /// unloaded; see `load_lists`.
    pub fn new(config: ShieldsConfig) -> Result<Self, SetupError> {
        config.validate()?;

        let backing: Arc<dyn ShieldStateStore> = match &config.state_path {
            Some(path) => Arc::new(JsonFileStateStore::open(path)?),
            None => Arc::new(MemoryStateStore::new()),
        };
        let state = Arc::new(ShieldStateService::new(backing)?);
        let policy = Arc::new(ShieldPolicy::new(config.defaults, state.clone()));

        let ad_block = Arc::new(AdBlockMatcher::new());
        let tracking_protection = Arc::new(TrackingProtectionMatcher::new());
        let safe_browsing = Arc::new(SafeBrowsingMatcher::new());
        let https_upgrade = Arc::new(HttpsUpgradeMatcher::new());
        let matchers = MatcherSet {
            https_upgrade: https_upgrade.clone(),
            safe_browsing: safe_browsing.clone(),
            tracking_protection: tracking_protection.clone(),
            ad_block: ad_block.clone(),
        };

        let (site_fixes, host_actions) = SiteFixes::new(
            config.site_fixes.clone(),
            LoopGuard::with_config(config.loop_guard),
        );

        let interceptor = RequestInterceptor::new(policy.clone(), matchers)
            .with_site_fixes(Arc::new(site_fixes))
            .with_adblock_exceptions(config.adblock_exceptions.clone())
            .with_pixel_hosts(config.pixel_hosts.clone())
            .with_internal_hosts(config.internal_hosts.clone());

        info!(
            "Shields ready: {} site fixes, {} pixel hosts, state {}",
            config.site_fixes.len(),
            config.pixel_hosts.len(),
            config
                .state_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "in memory".to_string())
        );

        Ok(Self {
            config,
            state,
            policy,
            interceptor,
            ad_block,
            tracking_protection,
            safe_browsing,
            https_upgrade,
            host_actions,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ShieldsConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &RequestInterceptor {
        &self.interceptor
    }

    pub fn state(&self) -> &Arc<ShieldStateService> {
        &self.state
    }

    /// Actions requested by site fixes, for the host to perform.
    ///
    /// The queue holds at most `HOST_ACTION_QUEUE` actions; an undrained
    /// host loses later ones.
    pub fn host_actions(&self) -> Receiver<HostAction> {
        self.host_actions.clone()
    }

    // --- Sessions & requests ---

    pub fn new_session(&self) -> Arc<PageSession> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        Arc::new(PageSession::new(id, self.config.cache))
    }

    pub fn classify(&self, session: &PageSession, request: &InterceptRequest) -> Verdict {
        self.interceptor.classify(session, request)
    }

    pub fn on_main_frame_navigation_start(&self, session: &PageSession, domain: &str) {
        session.on_main_frame_navigation_start(domain);
    }

    pub fn on_main_frame_navigation_end(&self, session: &PageSession) -> ShieldStats {
        session.on_main_frame_navigation_end()
    }

    pub fn fingerprint_protection_enabled(&self, session: &PageSession) -> bool {
        self.interceptor.fingerprint_protection_enabled(session)
    }

    // --- Shield state ---

    pub fn shield_state(&self, domain: &str) -> ShieldState {
        self.state.get(domain)
    }

    pub fn effective_policy(&self, domain: &str) -> EffectivePolicy {
        self.policy.resolve(&normalize_host(domain))
    }

    pub fn set_shield(&self, domain: &str, shield: Shield, enabled: Option<bool>) -> ShieldState {
        let state = self.state.set_shield(domain, shield, enabled);
        self.interceptor.invalidate_decisions();
        state
    }

    pub fn set_all_off(&self, domain: &str, all_off: bool) -> ShieldState {
        let state = self.state.set_all_off(domain, all_off);
        self.interceptor.invalidate_decisions();
        state
    }

    pub fn set_global_default(&self, shield: Shield, enabled: bool) {
        let mut defaults = self.policy.defaults();
        defaults.set(shield, enabled);
        self.policy.set_defaults(defaults);
        self.interceptor.invalidate_decisions();
        info!("Global default {} = {}", shield, enabled);
    }

    /// "Clear private data": forget every per-domain override
    pub fn clear_private_data(&self) {
        self.state.clear_all();
        self.interceptor.invalidate_decisions();
    }

    pub fn set_private_browsing(&self, private: bool) {
        self.state.set_private(private);
        self.interceptor.invalidate_decisions();
    }

    /// Wait for pending state writes
    pub fn flush(&self) {
        self.state.flush();
    }

    // --- Lists ---

    pub fn load_ad_block_str(&self, name: &str, content: &str) -> Result<usize, FilterListError> {
        let list = FilterList::parse_str(name, content)?;
        Ok(self.publish_ad_block(list))
    }

    pub fn load_tracking_str(&self, content: &str) -> usize {
        self.publish_trackers(TrackerList::parse(content))
    }

    pub fn load_safe_browsing_str(&self, content: &str) -> usize {
        self.publish_bad_domains(BadDomainSet::parse(content))
    }

    pub fn load_https_rules_str(&self, content: &str) -> usize {
        self.publish_https_rules(HttpsRules::parse(content))
    }

    /// Read and parse every configured list off the request path, then
    /// swap each one in. A list that fails keeps the previous snapshot.
    pub async fn load_lists(&self) -> Result<ListReport, SetupError> {
        let lists = self.config.lists.clone();
        let mut report = ListReport::default();

        if let Some(path) = &lists.ad_block {
            let content = read_list(path).await?;
            let name = path.display().to_string();
            let list = task::spawn_blocking(move || FilterList::parse_str(&name, &content))
                .await
                .map_err(|e| SetupError::Task(e.to_string()))??;
            report.ad_block_rules = Some(self.publish_ad_block(list));
        }

        if let Some(path) = &lists.tracking_protection {
            let content = read_list(path).await?;
            let list = parse_off_thread(move || TrackerList::parse(&content)).await?;
            report.tracker_domains = Some(self.publish_trackers(list));
        }

        if let Some(path) = &lists.safe_browsing {
            let content = read_list(path).await?;
            let set = parse_off_thread(move || BadDomainSet::parse(&content)).await?;
            report.bad_domains = Some(self.publish_bad_domains(set));
        }

        if let Some(path) = &lists.https_upgrade {
            let content = read_list(path).await?;
            let rules = parse_off_thread(move || HttpsRules::parse(&content)).await?;
            report.https_rules = Some(self.publish_https_rules(rules));
        }

        Ok(report)
    }

    fn publish_ad_block(&self, list: FilterList) -> usize {
        let count = list.rule_count();
        self.ad_block.load(list);
        self.interceptor.invalidate_decisions();
        count
    }

    fn publish_trackers(&self, list: TrackerList) -> usize {
        let count = list.len();
        self.tracking_protection.load(list);
        self.interceptor.invalidate_decisions();
        count
    }

    fn publish_bad_domains(&self, set: BadDomainSet) -> usize {
        let count = set.len();
        self.safe_browsing.load(set);
        self.interceptor.invalidate_decisions();
        count
    }

    fn publish_https_rules(&self, rules: HttpsRules) -> usize {
        let count = rules.len();
        self.https_upgrade.load(rules);
        self.interceptor.invalidate_decisions();
        count
    }
}

async fn read_list(path: &Path) -> Result<String, SetupError> {
    tokio::fs::read_to_string(path).await.map_err(|source| {
        warn!("Could not read list {:?}: {}", path, source);
        SetupError::ListRead {
            path: path.display().to_string(),
            source,
        }
    })
}

async fn parse_off_thread<T, F>(parse: F) -> Result<T, SetupError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    task::spawn_blocking(parse)
        .await
        .map_err(|e| SetupError::Task(e.to_string()))
}
