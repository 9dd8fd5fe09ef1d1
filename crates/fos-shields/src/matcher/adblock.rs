//! Ad-block matcher over an EasyList-style filter list.

use super::{FilterList, FilterListError, MatchResult, Matcher, MatcherKind, ResourceType, RuleSetCell};
use super::filter_list::RuleRequest;
use crate::domain::is_third_party;
use crate::error::ShieldError;
use std::io::Read;
use std::sync::Arc;
use tracing::{info, trace};
use url::Url;

/// Blocks third-party requests matched by the loaded filter list
#[derive(Default)]
pub struct AdBlockMatcher {
    rules: RuleSetCell<FilterList>,
}

impl AdBlockMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an already-parsed list
    pub fn load(&self, list: FilterList) -> u64 {
        let name = list.name.clone();
        let rules = list.rule_count();
        let version = self.rules.publish(list);
        info!("Ad-block list '{}' loaded: {} rules (v{})", name, rules, version);
        version
    }

    /// Parse and publish a list from a reader
    pub fn load_reader<R: Read>(&self, name: &str, reader: R) -> Result<u64, FilterListError> {
        let list = FilterList::parse(name, reader)?;
        Ok(self.load(list))
    }

    /// Parse and publish a list held in memory
    pub fn load_str(&self, name: &str, content: &str) -> Result<u64, FilterListError> {
        self.load_reader(name, content.as_bytes())
    }

    pub fn unload(&self) {
        self.rules.unload();
    }

    /// Current snapshot, for inspection
    pub fn snapshot(&self) -> Option<Arc<FilterList>> {
        self.rules.load()
    }
}

impl Matcher for AdBlockMatcher {
    fn kind(&self) -> MatcherKind {
        MatcherKind::AdBlock
    }

    fn is_loaded(&self) -> bool {
        self.rules.is_loaded()
    }

    fn query(
        &self,
        url: &Url,
        page_domain: &str,
        accept: Option<&str>,
    ) -> Result<MatchResult, ShieldError> {
        let Some(list) = self.rules.load() else {
            return Ok(MatchResult::no_match(MatcherKind::AdBlock));
        };

        let host = url.host_str().unwrap_or_default();
        if !is_third_party(host, page_domain) {
            return Ok(MatchResult::no_match(MatcherKind::AdBlock));
        }

        let resource_type = ResourceType::from_accept_or_path(accept, url.path());
        let request = RuleRequest::new(url, page_domain, resource_type);

        if list.should_block(&request) {
            trace!("Ad-block match: {}", url);
            Ok(MatchResult::matched(MatcherKind::AdBlock))
        } else {
            Ok(MatchResult::no_match(MatcherKind::AdBlock))
        }
    }
}
