//! Per-page shield statistics.

use crate::matcher::MatcherKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatCategory {
    AdBlockAndTp,
    SafeBrowsing,
    HttpsUpgrade,
    ScriptBlocking,
    FingerprintProtection,
}

impl StatCategory {
    pub const ALL: [StatCategory; 5] = [
        StatCategory::AdBlockAndTp,
        StatCategory::SafeBrowsing,
        StatCategory::HttpsUpgrade,
        StatCategory::ScriptBlocking,
        StatCategory::FingerprintProtection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::AdBlockAndTp => "adBlockAndTp",
            Self::SafeBrowsing => "safeBrowsing",
            Self::HttpsUpgrade => "httpsUpgrade",
            Self::ScriptBlocking => "scriptBlocking",
            Self::FingerprintProtection => "fingerprintProtection",
        }
    }
}

impl fmt::Display for StatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<MatcherKind> for StatCategory {
    fn from(kind: MatcherKind) -> Self {
        match kind {
            MatcherKind::AdBlock | MatcherKind::TrackingProtection => Self::AdBlockAndTp,
            MatcherKind::SafeBrowsing => Self::SafeBrowsing,
            MatcherKind::HttpsUpgrade => Self::HttpsUpgrade,
            MatcherKind::Script => Self::ScriptBlocking,
        }
    }
}

/// Block counters for one page load.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    ad_block_and_tp: AtomicU64,
    safe_browsing: AtomicU64,
    https_upgrade: AtomicU64,
    script_blocking: AtomicU64,
    fingerprint_protection: AtomicU64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, category: StatCategory) -> &AtomicU64 {
        match category {
            StatCategory::AdBlockAndTp => &self.ad_block_and_tp,
            StatCategory::SafeBrowsing => &self.safe_browsing,
            StatCategory::HttpsUpgrade => &self.https_upgrade,
            StatCategory::ScriptBlocking => &self.script_blocking,
            StatCategory::FingerprintProtection => &self.fingerprint_protection,
        }
    }

    pub fn increment(&self, category: StatCategory) {
        self.counter(category).fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite a counter (page scripts report their own totals)
    pub fn set(&self, category: StatCategory, value: u64) {
        self.counter(category).store(value, Ordering::Relaxed);
    }

    pub fn get(&self, category: StatCategory) -> u64 {
        self.counter(category).load(Ordering::Relaxed)
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for category in StatCategory::ALL {
            self.counter(category).store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ShieldStats {
        ShieldStats {
            ad_block_and_tp: self.get(StatCategory::AdBlockAndTp),
            safe_browsing: self.get(StatCategory::SafeBrowsing),
            https_upgrade: self.get(StatCategory::HttpsUpgrade),
            script_blocking: self.get(StatCategory::ScriptBlocking),
            fingerprint_protection: self.get(StatCategory::FingerprintProtection),
        }
    }
}

/// Point-in-time copy of the counters, for display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldStats {
    pub ad_block_and_tp: u64,
    pub safe_browsing: u64,
    pub https_upgrade: u64,
    pub script_blocking: u64,
    pub fingerprint_protection: u64,
}

impl ShieldStats {
    /// `{categoryName: count}`
    pub fn as_map(&self) -> BTreeMap<&'static str, u64> {
        StatCategory::ALL
            .into_iter()
            .map(|category| (category.name(), self.get(category)))
            .collect()
    }

    pub fn get(&self, category: StatCategory) -> u64 {
        match category {
            StatCategory::AdBlockAndTp => self.ad_block_and_tp,
            StatCategory::SafeBrowsing => self.safe_browsing,
            StatCategory::HttpsUpgrade => self.https_upgrade,
            StatCategory::ScriptBlocking => self.script_blocking,
            StatCategory::FingerprintProtection => self.fingerprint_protection,
        }
    }

    pub fn total(&self) -> u64 {
        StatCategory::ALL.into_iter().map(|c| self.get(c)).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}
