//! Decision Cache
//!
//! Small per-page memo of `(page domain, request URL) -> Decision`, so the
//! many identical requests of one page load are matched only once.
//!
//! - Fixed capacity, FIFO eviction by insertion order (not LRU)
//! - Keys carry the request's resource type, since filter options can
//!   depend on it
//! - Keys carry the interceptor's rule epoch: any policy or list change
//!   bumps the epoch, and entries from older epochs simply stop matching
//! - Cleared on main-frame navigation start
//!
//! Only the context-free part of a verdict is cached. Whether a block gets
//! an explanatory page or a pixel, and whether an upgrade substitutes or
//! navigates, is decided again for every request.

use crate::matcher::{MatcherKind, ResourceType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries (default: 64)
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub page_domain: String,
    pub url: String,
    pub resource_type: ResourceType,
    pub epoch: u64,
}

impl CacheKey {
    pub fn new(page_domain: &str, url: &Url, resource_type: ResourceType, epoch: u64) -> Self {
        Self {
            page_domain: page_domain.to_string(),
            url: url.as_str().to_string(),
            resource_type,
            epoch,
        }
    }
}

/// Outcome of the matcher stage for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// HTTPS upgrade to this URL
    Upgrade(Url),
    /// Blocked by this matcher
    Blocked(MatcherKind),
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Decision>,
    order: VecDeque<CacheKey>,
}

/// Fixed-capacity FIFO cache, safe to share between request threads
pub struct DecisionCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::new(config.capacity)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Decision> {
        let found = self.inner.lock().entries.get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Insert, evicting the oldest insertions beyond capacity.
    /// Replacing an existing key keeps its original position.
    pub fn put(&self, key: CacheKey, decision: Decision) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get_mut(&key) {
            *existing = decision;
            return;
        }

        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(key, decision);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::with_config(CacheConfig::default())
    }
}
