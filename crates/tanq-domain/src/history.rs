//! Report histories
//!
//! The `seen_domains` store keeps, per domain, a mapping from reporter
//! thumbprint to the unix time that reporter first mentioned the domain.
//! The first-seen time is never moved by later sightings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-domain record of which reporters have seen it, and when first.
///
/// Serialized as a flat JSON object, e.g. `{"E1": 1700000000}`. A stored
/// history is never empty; the map is ordered so the encoded form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportHistory(BTreeMap<String, i64>);

impl ReportHistory {
    /// A history with a single initial reporter.
    pub fn first(reporter: &str, now_unix: i64) -> Self {
        let mut map = BTreeMap::new();
        map.insert(reporter.to_string(), now_unix);
        Self(map)
    }

    /// Record a sighting by `reporter` at `now_unix`.
    ///
    /// Returns `true` if the reporter was not present before. An existing
    /// entry keeps its original timestamp.
    pub fn record(&mut self, reporter: &str, now_unix: i64) -> bool {
        if self.0.contains_key(reporter) {
            return false;
        }
        self.0.insert(reporter.to_string(), now_unix);
        true
    }

    /// First-seen unix time for a reporter, if it has reported.
    pub fn first_seen(&self, reporter: &str) -> Option<i64> {
        self.0.get(reporter).copied()
    }

    pub fn contains(&self, reporter: &str) -> bool {
        self.0.contains_key(reporter)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn reporters(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
