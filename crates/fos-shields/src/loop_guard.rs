//! Redirect loop guard for automatic corrective actions.
//!
//! Counts how often a corrective action fired for a pattern inside a
//! rolling window. Once the count exceeds the threshold the pattern is
//! "looping" and the action is skipped until the window rolls over.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Loop guard configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopGuardConfig {
    /// Window length in seconds (default: 10)
    pub window_secs: u64,
    /// Actions allowed per window before the guard trips (default: 10)
    pub threshold: u32,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

pub struct LoopGuard {
    window: Duration,
    threshold: u32,
    patterns: Mutex<HashMap<String, WindowState>>,
}

impl LoopGuard {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(config: LoopGuardConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.threshold)
    }

    pub fn increment(&self, pattern: &str) {
        self.increment_at(pattern, Instant::now());
    }

    pub fn is_looping(&self, pattern: &str) -> bool {
        self.is_looping_at(pattern, Instant::now())
    }

    /// Count one action at `now`, restarting the window if it has elapsed
    pub fn increment_at(&self, pattern: &str, now: Instant) {
        let mut patterns = self.patterns.lock();
        let state = patterns.entry(pattern.to_string()).or_insert(WindowState {
            window_start: now,
            count: 0,
        });

        if now.saturating_duration_since(state.window_start) > self.window {
            state.window_start = now;
            state.count = 0;
        }
        state.count = state.count.saturating_add(1);
    }

    pub fn is_looping_at(&self, pattern: &str, now: Instant) -> bool {
        let patterns = self.patterns.lock();
        match patterns.get(pattern) {
            Some(state) => {
                now.saturating_duration_since(state.window_start) <= self.window
                    && state.count > self.threshold
            }
            None => false,
        }
    }

    /// Forget a pattern
    pub fn reset(&self, pattern: &str) {
        self.patterns.lock().remove(pattern);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::with_config(LoopGuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_not_exceeded() {
        let guard = LoopGuard::new(Duration::from_secs(10), 3);
        let start = Instant::now();

        for i in 0..3 {
            guard.increment_at("p", start + Duration::from_millis(i));
        }
        assert!(!guard.is_looping_at("p", start + Duration::from_millis(5)));
        assert!(!guard.is_looping_at("other", start));
    }

    #[test]
    fn test_trips_above_threshold() {
        let guard = LoopGuard::new(Duration::from_secs(10), 3);
        let start = Instant::now();

        for i in 0..4 {
            guard.increment_at("p", start + Duration::from_secs(i));
        }
        assert!(guard.is_looping_at("p", start + Duration::from_secs(4)));
        assert!(guard.is_looping_at("p", start + Duration::from_secs(10)));

        // Window rolled over
        assert!(!guard.is_looping_at("p", start + Duration::from_secs(11)));
    }

    #[test]
    fn test_increment_after_window_restarts_count() {
        let guard = LoopGuard::new(Duration::from_secs(10), 1);
        let start = Instant::now();

        guard.increment_at("p", start);
        guard.increment_at("p", start + Duration::from_secs(1));
        assert!(guard.is_looping_at("p", start + Duration::from_secs(1)));

        let later = start + Duration::from_secs(20);
        guard.increment_at("p", later);
        assert!(!guard.is_looping_at("p", later));
    }

    #[test]
    fn test_patterns_are_independent() {
        let guard = LoopGuard::new(Duration::from_secs(10), 0);
        guard.increment("a");
        assert!(guard.is_looping("a"));
        assert!(!guard.is_looping("b"));

        guard.reset("a");
        assert!(!guard.is_looping("a"));
    }
}
