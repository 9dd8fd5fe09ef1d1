//! Failures the shield pipeline recovers from.
//!
//! None of these ever leave `RequestInterceptor::classify`; each one has a
//! fail-safe default and is only logged.

use crate::matcher::MatcherKind;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ShieldError {
    /// Persisted shield state could not be read; global defaults apply
    #[error("Shield state for '{domain}' unavailable, using defaults: {reason}")]
    PolicyResolution { domain: String, reason: String },

    /// Rule set not loaded yet (or failed to load); matcher fails open
    #[error("{0} rules not loaded, not matching")]
    MatcherUnavailable(MatcherKind),

    /// A matcher query failed; treated as a non-match for that matcher only
    #[error("{kind} query failed for {url}: {reason}")]
    MatcherFailed {
        kind: MatcherKind,
        url: String,
        reason: String,
    },

    /// Corrective action suppressed for the rest of the guard window
    #[error("Redirect loop detected for '{0}', suppressing corrective action")]
    RedirectLoopDetected(String),

    /// Unparseable request URL; passed through untouched
    #[error("Malformed URL '{url}': {reason}")]
    MalformedUrl { url: String, reason: String },
}
