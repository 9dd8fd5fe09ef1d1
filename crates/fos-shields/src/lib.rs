//! fOS Shields
//!
//! Per-request content shielding for the browser's web views.
//!
//! Architecture:
//! 1. Transport hands every outgoing request to `RequestInterceptor::classify`
//! 2. `ShieldPolicy` resolves the page's effective shields (defaults +
//!    per-domain overrides, or "all off")
//! 3. Matchers run in fixed precedence: HTTPS upgrade, safe browsing,
//!    tracking protection + ad-block, script blocking
//! 4. Verdict goes back to the transport; stats are counted per page
//!
//! Rule sets are immutable snapshots swapped atomically on reload, so the
//! decision path never locks against a loader and never does I/O.

pub mod cache;
pub mod compat;
pub mod config;
pub mod domain;
pub mod error;
pub mod interceptor;
pub mod loop_guard;
pub mod matcher;
pub mod policy;
pub mod response;
pub mod service;
pub mod session;
pub mod state_store;
pub mod stats;

pub use cache::{CacheConfig, CacheKey, Decision, DecisionCache};
pub use compat::{CookieFix, HOST_ACTION_QUEUE, HostAction, SiteFix, SiteFixes};
pub use config::{AdBlockException, ConfigError, ListPaths, ShieldsConfig};
pub use error::ShieldError;
pub use interceptor::{
    BlockBody, InterceptRequest, MatcherSet, RedirectMode, RequestInterceptor, Verdict,
};
pub use loop_guard::{LoopGuard, LoopGuardConfig};
pub use matcher::{
    AdBlockMatcher, HttpsUpgradeMatcher, MatchResult, Matcher, MatcherKind, ResourceType,
    SafeBrowsingMatcher, TrackingProtectionMatcher,
};
pub use policy::{EffectivePolicy, GlobalDefaults, Shield, ShieldPolicy, ShieldState};
pub use response::SyntheticResponse;
pub use service::{ListReport, SetupError, Shields};
pub use session::{PageSession, SessionId};
pub use state_store::{
    JsonFileStateStore, MemoryStateStore, ShieldStateService, ShieldStateStore, StoreError,
};
pub use stats::{ShieldStats, StatCategory, StatsAggregator};
