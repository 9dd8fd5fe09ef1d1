//! Shield Policy
//!
//! Resolves the effective on/off set of shields for one request.
//!
//! Resolution:
//! 1. read the persisted `ShieldState` of the page's normalized domain
//!    (absent means every field unset)
//! 2. `all_off` short-circuits: every shield is off
//! 3. otherwise each shield is the domain override if set, else the global
//!    default
//!
//! A store read failure is not an error for the caller: it is logged and the
//! global defaults apply.

use crate::error::ShieldError;
use crate::state_store::ShieldStateStore;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Persisted key of the escape hatch
pub const ALL_OFF_KEY: &str = "all_off";

/// One independently toggleable shield
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shield {
    AdBlockAndTp,
    HttpsUpgrade,
    SafeBrowsing,
    NoScript,
    FingerprintProtection,
}

impl Shield {
    pub const ALL: [Shield; 5] = [
        Shield::AdBlockAndTp,
        Shield::HttpsUpgrade,
        Shield::SafeBrowsing,
        Shield::NoScript,
        Shield::FingerprintProtection,
    ];

    /// Key used in the persisted state
    pub fn key(self) -> &'static str {
        match self {
            Self::AdBlockAndTp => "adblock_and_tp",
            Self::HttpsUpgrade => "httpse",
            Self::SafeBrowsing => "safebrowsing",
            Self::NoScript => "noscript",
            Self::FingerprintProtection => "fp_protection",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|shield| shield.key() == key)
    }
}

impl fmt::Display for Shield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Error)]
#[error("Unknown shield '{0}'")]
pub struct UnknownShield(pub String);

impl FromStr for Shield {
    type Err = UnknownShield;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        if let Some(shield) = Self::from_key(&name) {
            return Ok(shield);
        }
        match name.as_str() {
            "adblock" | "ad-block" | "tracking" => Ok(Self::AdBlockAndTp),
            "https" | "https-upgrade" => Ok(Self::HttpsUpgrade),
            "safe-browsing" => Ok(Self::SafeBrowsing),
            "script" | "scripts" => Ok(Self::NoScript),
            "fingerprint" | "fingerprinting" => Ok(Self::FingerprintProtection),
            _ => Err(UnknownShield(s.to_string())),
        }
    }
}

/// Per-domain overrides. `None` means "use the global default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldState {
    pub all_off: bool,
    pub ad_block_and_tp: Option<bool>,
    pub https_upgrade: Option<bool>,
    pub safe_browsing: Option<bool>,
    pub no_script: Option<bool>,
    pub fingerprint_protection: Option<bool>,
}

impl ShieldState {
    pub fn get(&self, shield: Shield) -> Option<bool> {
        match shield {
            Shield::AdBlockAndTp => self.ad_block_and_tp,
            Shield::HttpsUpgrade => self.https_upgrade,
            Shield::SafeBrowsing => self.safe_browsing,
            Shield::NoScript => self.no_script,
            Shield::FingerprintProtection => self.fingerprint_protection,
        }
    }

    pub fn set(&mut self, shield: Shield, value: Option<bool>) {
        let slot = match shield {
            Shield::AdBlockAndTp => &mut self.ad_block_and_tp,
            Shield::HttpsUpgrade => &mut self.https_upgrade,
            Shield::SafeBrowsing => &mut self.safe_browsing,
            Shield::NoScript => &mut self.no_script,
            Shield::FingerprintProtection => &mut self.fingerprint_protection,
        };
        *slot = value;
    }

    /// Nothing overridden; such a state need not be stored
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Flatten into persisted keys. Unset shields are omitted and `all_off`
    /// is only written when set.
    pub fn to_map(&self) -> BTreeMap<String, bool> {
        let mut map: BTreeMap<String, bool> = Shield::ALL
            .into_iter()
            .filter_map(|shield| self.get(shield).map(|v| (shield.key().to_string(), v)))
            .collect();
        if self.all_off {
            map.insert(ALL_OFF_KEY.to_string(), true);
        }
        map
    }

    /// Inverse of `to_map`; unknown keys are ignored
    pub fn from_map(map: &BTreeMap<String, bool>) -> Self {
        let mut state = Self {
            all_off: map.get(ALL_OFF_KEY).copied().unwrap_or(false),
            ..Self::default()
        };
        for (key, value) in map {
            if let Some(shield) = Shield::from_key(key) {
                state.set(shield, Some(*value));
            }
        }
        state
    }
}

/// User-level default for every shield
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub ad_block_and_tp: bool,
    pub https_upgrade: bool,
    pub safe_browsing: bool,
    pub no_script: bool,
    pub fingerprint_protection: bool,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            ad_block_and_tp: true,
            https_upgrade: true,
            safe_browsing: true,
            no_script: false,
            fingerprint_protection: false,
        }
    }
}

impl GlobalDefaults {
    pub fn get(&self, shield: Shield) -> bool {
        match shield {
            Shield::AdBlockAndTp => self.ad_block_and_tp,
            Shield::HttpsUpgrade => self.https_upgrade,
            Shield::SafeBrowsing => self.safe_browsing,
            Shield::NoScript => self.no_script,
            Shield::FingerprintProtection => self.fingerprint_protection,
        }
    }

    pub fn set(&mut self, shield: Shield, enabled: bool) {
        let slot = match shield {
            Shield::AdBlockAndTp => &mut self.ad_block_and_tp,
            Shield::HttpsUpgrade => &mut self.https_upgrade,
            Shield::SafeBrowsing => &mut self.safe_browsing,
            Shield::NoScript => &mut self.no_script,
            Shield::FingerprintProtection => &mut self.fingerprint_protection,
        };
        *slot = enabled;
    }
}

/// Request-scoped resolution of defaults and overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectivePolicy {
    pub all_off: bool,
    pub ad_block_and_tp: bool,
    pub https_upgrade: bool,
    pub safe_browsing: bool,
    pub no_script: bool,
    pub fingerprint_protection: bool,
}

impl EffectivePolicy {
    /// Everything disabled
    pub fn all_off() -> Self {
        Self {
            all_off: true,
            ad_block_and_tp: false,
            https_upgrade: false,
            safe_browsing: false,
            no_script: false,
            fingerprint_protection: false,
        }
    }

    /// Merge domain overrides over the defaults
    pub fn merge(defaults: &GlobalDefaults, state: &ShieldState) -> Self {
        if state.all_off {
            return Self::all_off();
        }
        let effective = |shield| state.get(shield).unwrap_or_else(|| defaults.get(shield));
        Self {
            all_off: false,
            ad_block_and_tp: effective(Shield::AdBlockAndTp),
            https_upgrade: effective(Shield::HttpsUpgrade),
            safe_browsing: effective(Shield::SafeBrowsing),
            no_script: effective(Shield::NoScript),
            fingerprint_protection: effective(Shield::FingerprintProtection),
        }
    }

    pub fn is_enabled(&self, shield: Shield) -> bool {
        if self.all_off {
            return false;
        }
        match shield {
            Shield::AdBlockAndTp => self.ad_block_and_tp,
            Shield::HttpsUpgrade => self.https_upgrade,
            Shield::SafeBrowsing => self.safe_browsing,
            Shield::NoScript => self.no_script,
            Shield::FingerprintProtection => self.fingerprint_protection,
        }
    }
}

/// Resolves `EffectivePolicy` from the state store and global defaults
pub struct ShieldPolicy {
    defaults: ArcSwap<GlobalDefaults>,
    store: Arc<dyn ShieldStateStore>,
}

impl ShieldPolicy {
    pub fn new(defaults: GlobalDefaults, store: Arc<dyn ShieldStateStore>) -> Self {
        Self {
            defaults: ArcSwap::from_pointee(defaults),
            store,
        }
    }

    /// Effective policy for a normalized domain
    pub fn resolve(&self, domain: &str) -> EffectivePolicy {
        let defaults = self.defaults.load();
        let state = match self.store.read(domain) {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                let error = ShieldError::PolicyResolution {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                };
                warn!("{}", error);
                ShieldState::default()
            }
        };
        EffectivePolicy::merge(&defaults, &state)
    }

    pub fn defaults(&self) -> GlobalDefaults {
        **self.defaults.load()
    }

    pub fn set_defaults(&self, defaults: GlobalDefaults) {
        self.defaults.store(Arc::new(defaults));
    }

    pub fn store(&self) -> &Arc<dyn ShieldStateStore> {
        &self.store
    }
}
