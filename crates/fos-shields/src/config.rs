//! Shields Configuration
//!
//! Everything tunable about the pipeline, loadable from TOML. Every field
//! has a default, so an empty file is a valid configuration.

use crate::cache::CacheConfig;
use crate::compat::{CookieFix, SiteFix};
use crate::loop_guard::LoopGuardConfig;
use crate::policy::GlobalDefaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Ad-block is skipped for a URL containing `url_contains` on a page whose
/// domain contains `page_domain_contains`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdBlockException {
    pub page_domain_contains: String,
    pub url_contains: String,
}

impl AdBlockException {
    pub fn applies(&self, page_domain: &str, url: &str) -> bool {
        page_domain.contains(&self.page_domain_contains) && url.contains(&self.url_contains)
    }
}

/// Data files for the matchers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListPaths {
    /// EasyList-format filter list
    pub ad_block: Option<PathBuf>,
    /// One tracker domain per line
    pub tracking_protection: Option<PathBuf>,
    /// One bad domain per line
    pub safe_browsing: Option<PathBuf>,
    /// HTTPS upgrade host rules
    pub https_upgrade: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldsConfig {
    /// Global default for each shield
    pub defaults: GlobalDefaults,
    pub cache: CacheConfig,
    pub loop_guard: LoopGuardConfig,
    /// Hosts whose blocked requests get a transparent pixel, not an empty body
    pub pixel_hosts: Vec<String>,
    pub adblock_exceptions: Vec<AdBlockException>,
    /// Hosts serving the browser's own pages; never intercepted
    pub internal_hosts: Vec<String>,
    pub site_fixes: Vec<SiteFix>,
    pub lists: ListPaths,
    /// Persisted per-domain shield state; memory only when unset
    pub state_path: Option<PathBuf>,
}

impl Default for ShieldsConfig {
    fn default() -> Self {
        Self {
            defaults: GlobalDefaults::default(),
            cache: CacheConfig::default(),
            loop_guard: LoopGuardConfig::default(),
            pixel_hosts: vec![
                "pcworldcommunication.d2.sc.omtrdc.net".to_string(),
                "b.scorecardresearch.com".to_string(),
            ],
            adblock_exceptions: vec![AdBlockException {
                page_domain_contains: "yahoo".to_string(),
                url_contains: "s.yimg.com/zz/combo".to_string(),
            }],
            internal_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            site_fixes: vec![SiteFix {
                host_suffix: "forbes.com".to_string(),
                cookie: Some(CookieFix {
                    name: "forbes bypass".to_string(),
                    value: "forbes_ab=true; welcomeAd=true; adblock_session=Off; dailyWelcomeCookie=true"
                        .to_string(),
                    domain: "www.forbes.com".to_string(),
                    max_age_days: 30,
                }),
                trigger_path: Some("/forbes/welcome".to_string()),
                corrective_url: Some("http://www.forbes.com".to_string()),
            }],
            lists: ListPaths::default(),
            state_path: None,
        }
    }
}

impl ShieldsConfig {
    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be at least 1".into()));
        }
        if self.loop_guard.window_secs == 0 {
            return Err(ConfigError::Invalid("loop_guard.window_secs must be at least 1".into()));
        }
        if self.loop_guard.threshold == 0 {
            return Err(ConfigError::Invalid("loop_guard.threshold must be at least 1".into()));
        }
        if let Some(fix) = self.site_fixes.iter().find(|f| f.host_suffix.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "site fix with empty host_suffix: {:?}",
                fix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = ShieldsConfig::from_toml_str("").unwrap();
        assert_eq!(config, ShieldsConfig::default());
        assert_eq!(config.cache.capacity, 64);
        assert_eq!(config.loop_guard.threshold, 10);
        assert!(config.defaults.ad_block_and_tp);
        assert!(!config.defaults.no_script);
    }

    #[test]
    fn test_partial_toml() {
        let config = ShieldsConfig::from_toml_str(
            r#"
pixel_hosts = ["pixel.example"]
site_fixes = []

[defaults]
no_script = true

[cache]
capacity = 8

[lists]
ad_block = "/data/easylist.txt"
"#,
        )
        .unwrap();

        assert!(config.defaults.no_script);
        assert!(config.defaults.https_upgrade);
        assert_eq!(config.cache.capacity, 8);
        assert_eq!(config.pixel_hosts, vec!["pixel.example"]);
        assert!(config.site_fixes.is_empty());
        assert_eq!(config.lists.ad_block, Some(PathBuf::from("/data/easylist.txt")));
        assert_eq!(config.lists.safe_browsing, None);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ShieldsConfig::from_toml_str("[cache]\ncapacity = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ShieldsConfig::from_toml_str("[loop_guard]\nthreshold = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ShieldsConfig::from_toml_str("cache = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ShieldsConfig::default();
        let toml = config.to_toml().unwrap();
        assert_eq!(ShieldsConfig::from_toml_str(&toml).unwrap(), config);
    }

    #[test]
    fn test_adblock_exception() {
        let exception = &ShieldsConfig::default().adblock_exceptions[0];
        assert!(exception.applies("news.yahoo.com", "https://s.yimg.com/zz/combo?a.js"));
        assert!(!exception.applies("example.com", "https://s.yimg.com/zz/combo?a.js"));
    }
}
