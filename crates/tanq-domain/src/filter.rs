//! Ignore-suffix filter
//!
//! Events for qnames under certain suffixes (reverse-lookup zones, internal
//! test zones) are dropped before they touch the KV stores.

use crate::name::DomainName;

/// Filter dropping domains under any of a configured set of suffixes.
///
/// Matching is label-aware: `example.com` matches `example.com` and
/// `www.example.com` but not `badexample.com`.
#[derive(Debug, Clone, Default)]
pub struct SuffixFilter {
    suffixes: Vec<String>,
}

impl SuffixFilter {
    /// Build a filter from configured suffixes. Leading and trailing dots
    /// are trimmed once here; empty entries are ignored.
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = suffixes
            .into_iter()
            .map(|s| s.as_ref().trim_matches('.').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self { suffixes }
    }

    /// Whether `domain` falls under any ignored suffix.
    pub fn matches(&self, domain: &DomainName) -> bool {
        let name = domain.as_str();
        self.suffixes.iter().any(|suffix| {
            name == suffix
                || name
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }
}
