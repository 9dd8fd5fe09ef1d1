//! Page sessions.
//!
//! A `PageSession` is the explicit context of one tab's current page load:
//! its normalized page domain, decision cache and stats, and a navigation
//! generation. The interceptor receives the session with every request.
//!
//! Navigation start bumps the generation. A decision that began under an
//! older generation belongs to a page that is gone; it is still returned
//! to the caller but never cached or counted.

use crate::cache::{CacheConfig, CacheKey, Decision, DecisionCache};
use crate::domain::normalize_host;
use crate::stats::{ShieldStats, StatCategory, StatsAggregator};
use parking_lot::RwLock;
use std::fmt;
use tracing::debug;

/// Session identifier (one per tab)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What identifies the page currently open in the session
#[derive(Debug, Default)]
struct PageState {
    generation: u64,
    domain: Option<String>,
}

pub struct PageSession {
    id: SessionId,
    /// Held for writing while a navigation resets the page, and for reading
    /// while a decision is cached or counted
    page: RwLock<PageState>,
    cache: DecisionCache,
    stats: StatsAggregator,
}

impl PageSession {
    pub fn new(id: SessionId, cache: CacheConfig) -> Self {
        Self {
            id,
            page: RwLock::new(PageState::default()),
            cache: DecisionCache::with_config(cache),
            stats: StatsAggregator::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// A new main-frame navigation: forget everything about the old page
    pub fn on_main_frame_navigation_start(&self, domain: &str) {
        let mut page = self.page.write();
        page.generation += 1;
        page.domain = Some(normalize_host(domain));
        self.cache.clear();
        self.stats.reset();
        debug!("{} navigating to '{}' (generation {})", self.id, domain, page.generation);
    }

    /// Navigation finished; the stats of the page that loaded
    pub fn on_main_frame_navigation_end(&self) -> ShieldStats {
        self.stats.snapshot()
    }

    pub fn generation(&self) -> u64 {
        self.page.read().generation
    }

    /// Whether a decision started at `generation` is still for this page
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn page_domain(&self) -> Option<String> {
        self.page.read().domain.clone()
    }

    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Cache a decision made at `generation`, unless the page has changed
    pub fn cache_decision(&self, generation: u64, key: CacheKey, decision: Decision) -> bool {
        let page = self.page.read();
        if page.generation != generation {
            return false;
        }
        self.cache.put(key, decision);
        true
    }

    /// Count one event if the page is still the one it was observed on
    pub fn record(&self, generation: u64, category: StatCategory) -> bool {
        let page = self.page.read();
        if page.generation != generation {
            return false;
        }
        self.stats.increment(category);
        true
    }

    /// Fingerprinting attempt reported by the injected page script
    pub fn record_fingerprinting_attempt(&self) {
        self.stats.increment(StatCategory::FingerprintProtection);
    }

    /// Number of scripts the page reports as blocked
    pub fn set_scripts_blocked(&self, count: u64) {
        self.stats.set(StatCategory::ScriptBlocking, count);
    }

    pub fn stats_snapshot(&self) -> ShieldStats {
        self.stats.snapshot()
    }
}
