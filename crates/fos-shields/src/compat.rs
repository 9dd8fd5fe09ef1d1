//! Site Compatibility Fixes
//!
//! Narrow, domain-keyed workarounds for sites that break under shields.
//! They are part of ad-block/tracking protection: the interceptor runs them
//! only after the page's policy resolved with that shield on.
//!
//! A fix can:
//! - ask the host to set a cookie (once per process)
//! - ask the host to navigate to a corrective URL when a trigger path is
//!   requested, at most `threshold` times per loop-guard window
//!
//! Requests are never blocked or changed here; actions go to the host over
//! a bounded channel and the request continues through the pipeline. When
//! the host stops draining it, further actions are dropped.

use crate::domain::host_matches_suffix;
use crate::error::ShieldError;
use crate::loop_guard::LoopGuard;
use crate::session::SessionId;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use url::Url;

/// Host actions held while the host is not draining
pub const HOST_ACTION_QUEUE: usize = 64;

/// Cookie the host should store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieFix {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_days")]
    pub max_age_days: u32,
}

fn default_cookie_days() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFix {
    /// Requests to this host or its subdomains are affected
    pub host_suffix: String,
    #[serde(default)]
    pub cookie: Option<CookieFix>,
    /// URL path fragment that triggers the corrective navigation
    #[serde(default)]
    pub trigger_path: Option<String>,
    #[serde(default)]
    pub corrective_url: Option<String>,
}

/// Work for the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    SetCookie { session: SessionId, cookie: CookieFix },
    Navigate { session: SessionId, url: Url },
}

struct ActiveFix {
    fix: SiteFix,
    corrective_url: Option<Url>,
    cookie_sent: AtomicBool,
}

pub struct SiteFixes {
    fixes: Vec<ActiveFix>,
    guard: LoopGuard,
    actions: Sender<HostAction>,
}

impl SiteFixes {
    /// Build the fixes; the receiver gets every `HostAction`
    pub fn new(fixes: Vec<SiteFix>, guard: LoopGuard) -> (Self, Receiver<HostAction>) {
        let (tx, rx) = bounded(HOST_ACTION_QUEUE);
        let fixes = fixes
            .into_iter()
            .map(|fix| {
                let corrective_url = fix.corrective_url.as_deref().and_then(|raw| match Url::parse(raw) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!("Ignoring corrective URL '{}' for {}: {}", raw, fix.host_suffix, e);
                        None
                    }
                });
                ActiveFix {
                    fix: SiteFix {
                        host_suffix: fix.host_suffix.to_ascii_lowercase(),
                        ..fix
                    },
                    corrective_url,
                    cookie_sent: AtomicBool::new(false),
                }
            })
            .collect();

        (
            Self {
                fixes,
                guard,
                actions: tx,
            },
            rx,
        )
    }

    /// Run every fix that applies to the request
    pub fn apply(&self, session: SessionId, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };

        for active in self
            .fixes
            .iter()
            .filter(|a| host_matches_suffix(host, &a.fix.host_suffix))
        {
            if let Some(cookie) = &active.fix.cookie {
                if !active.cookie_sent.swap(true, Ordering::AcqRel) {
                    debug!("Setting compatibility cookie '{}' for {}", cookie.name, cookie.domain);
                    self.send(HostAction::SetCookie {
                        session,
                        cookie: cookie.clone(),
                    });
                }
            }

            let (Some(trigger), Some(target)) = (&active.fix.trigger_path, &active.corrective_url) else {
                continue;
            };
            if !url.path().contains(trigger.as_str()) {
                continue;
            }

            let pattern = &active.fix.host_suffix;
            self.guard.increment(pattern);
            if self.guard.is_looping(pattern) {
                warn!("{}", ShieldError::RedirectLoopDetected(pattern.clone()));
                continue;
            }

            debug!("Corrective navigation for {}: {}", pattern, target);
            self.send(HostAction::Navigate {
                session,
                url: target.clone(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    fn send(&self, action: HostAction) {
        match self.actions.try_send(action) {
            Ok(()) => {}
            Err(TrySendError::Full(action)) => {
                warn!("Host action queue full; dropping {:?}", action);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("No host listening for site fix actions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn welcome_fix() -> SiteFix {
        SiteFix {
            host_suffix: "news.example".to_string(),
            cookie: Some(CookieFix {
                name: "bypass".to_string(),
                value: "welcome=false".to_string(),
                domain: "www.news.example".to_string(),
                max_age_days: 30,
            }),
            trigger_path: Some("/welcome".to_string()),
            corrective_url: Some("http://www.news.example".to_string()),
        }
    }

    #[test]
    fn test_cookie_sent_once() {
        let (fixes, rx) = SiteFixes::new(vec![welcome_fix()], LoopGuard::default());
        let url = Url::parse("https://www.news.example/story").unwrap();

        fixes.apply(SessionId(1), &url);
        fixes.apply(SessionId(1), &url);

        let actions: Vec<_> = rx.try_iter().collect();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], HostAction::SetCookie { cookie, .. } if cookie.name == "bypass"));
    }

    #[test]
    fn test_corrective_navigation_is_bounded() {
        let guard = LoopGuard::new(Duration::from_secs(60), 2);
        let (fixes, rx) = SiteFixes::new(vec![welcome_fix()], guard);
        let url = Url::parse("https://www.news.example/welcome?to=home").unwrap();

        for _ in 0..5 {
            fixes.apply(SessionId(7), &url);
        }

        let navigations = rx
            .try_iter()
            .filter(|a| matches!(a, HostAction::Navigate { session: SessionId(7), .. }))
            .count();
        assert_eq!(navigations, 2);
    }

    #[test]
    fn test_unrelated_host_untouched() {
        let (fixes, rx) = SiteFixes::new(vec![welcome_fix()], LoopGuard::default());
        fixes.apply(SessionId(1), &Url::parse("https://other.example/welcome").unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_undrained_queue_stays_bounded() {
        let guard = LoopGuard::new(Duration::from_secs(60), 1000);
        let (fixes, rx) = SiteFixes::new(vec![welcome_fix()], guard);
        let url = Url::parse("https://www.news.example/welcome").unwrap();

        for _ in 0..(HOST_ACTION_QUEUE * 2) {
            fixes.apply(SessionId(3), &url);
        }
        assert_eq!(rx.len(), HOST_ACTION_QUEUE);

        // Draining makes room again
        let drained = rx.try_iter().count();
        assert_eq!(drained, HOST_ACTION_QUEUE);
        fixes.apply(SessionId(3), &url);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_apply_without_host() {
        let (fixes, rx) = SiteFixes::new(vec![welcome_fix()], LoopGuard::default());
        drop(rx);
        fixes.apply(SessionId(1), &Url::parse("https://www.news.example/welcome").unwrap());
    }
}
