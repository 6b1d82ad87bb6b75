//! Normalized domain names and the flipped subject scheme
//!
//! Bus subjects and KV keys derived from a qname carry the labels in
//! reverse order ("www.example.com" becomes "com.example.www") so that the
//! subject hierarchy lines up with the DNS zone hierarchy and wildcard
//! subscriptions can walk it by TLD or SLD.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// A fully-qualified domain name in normalized form: labels separated by
/// `.`, no leading or trailing dot, no empty labels. Labels are compared
/// case-sensitively; upstream lowercases qnames before they reach us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainName(String);

impl DomainName {
    /// Normalize a raw qname. Strips a single trailing dot and drops empty
    /// labels left over from it; an input with no labels at all is an error.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let labels: Vec<&str> = raw.split('.').filter(|l| !l.is_empty()).collect();
        if labels.is_empty() {
            return Err(DomainError::EmptyDomain);
        }
        Ok(Self(labels.join(".")))
    }

    /// The normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Labels in DNS order (leftmost first).
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The name with labels reversed: `a.b.c` becomes `c.b.a`.
    pub fn flipped(&self) -> String {
        let mut labels: Vec<&str> = self.0.split('.').collect();
        labels.reverse();
        labels.join(".")
    }

    /// Subject/key for this domain under a prefix, optionally followed by a
    /// suffix label: `prefix.c.b.a[.suffix]` for domain `a.b.c`.
    ///
    /// The prefix may itself be dotted; leading/trailing delimiter dots are
    /// trimmed so a sloppily configured prefix cannot produce empty tokens.
    pub fn subject(&self, prefix: &str, suffix: &str) -> String {
        let mut parts = Vec::new();
        let prefix = prefix.trim_matches('.');
        if !prefix.is_empty() {
            parts.push(prefix);
        }
        let flipped = self.flipped();
        parts.push(&flipped);
        let suffix = suffix.trim_matches('.');
        if !suffix.is_empty() {
            parts.push(suffix);
        }
        parts.join(".")
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
