//! Domain Normalization
//!
//! Every domain-keyed lookup (shield state, policy, decision cache, site
//! fixes) goes through `normalize_host` so the keys never diverge.
//!
//! Normalization:
//! - lower-case, trailing root dot removed
//! - generic prefixes (`www.`, `m.`, `mobile.`) stripped repeatedly,
//!   as long as something with a dot remains

use url::Url;

/// Generic subdomain prefixes that do not change which site is meant
const GENERIC_PREFIXES: &[&str] = &["www.", "mobile.", "m."];

/// Normalize a host into the domain key used everywhere
pub fn normalize_host(host: &str) -> String {
    let mut host = host.trim().trim_end_matches('.').to_ascii_lowercase();

    loop {
        let stripped = GENERIC_PREFIXES
            .iter()
            .find_map(|prefix| host.strip_prefix(prefix))
            .filter(|rest| rest.contains('.'))
            .map(str::to_string);

        match stripped {
            Some(rest) => host = rest,
            None => return host,
        }
    }
}

/// Normalized domain of a URL, `None` for host-less URLs
pub fn normalized_domain(url: &Url) -> Option<String> {
    url.host_str()
        .map(normalize_host)
        .filter(|host| !host.is_empty())
}

/// `true` if `host` is `suffix` or one of its subdomains
#[inline]
pub fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    host == suffix
        || (host.len() > suffix.len()
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
}

/// Walk a host and its parent domains: `a.b.c` → `a.b.c`, `b.c`, `c`
pub fn host_suffixes(host: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(host);
    std::iter::from_fn(move || {
        let current = next?;
        next = current
            .find('.')
            .map(|idx| &current[idx + 1..])
            .filter(|rest| !rest.is_empty());
        Some(current)
    })
}

/// Whether a request host belongs to a different site than the page.
///
/// Same site means one host is the other or a subdomain of it, after
/// normalization. An empty page domain (no main document) counts as
/// first party.
pub fn is_third_party(request_host: &str, page_domain: &str) -> bool {
    if page_domain.is_empty() {
        return false;
    }
    let request = normalize_host(request_host);
    !(host_matches_suffix(&request, page_domain) || host_matches_suffix(page_domain, &request))
}
