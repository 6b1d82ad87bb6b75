//! Observation messages
//!
//! An observation asserts a property of a domain to downstream consumers.
//! Properties are encoded as bits in a 32-bit tag mask; this analyst emits
//! only `globally_new`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::name::DomainName;

/// Tag bit for "first sight of this domain anywhere in the fleet".
pub const TAG_GLOBALLY_NEW: u32 = 0x800;

/// Producer identity carried in the message metadata and stored as the
/// `globally_new` marker value.
pub const CREATOR: &str = "tapir-analyse-new-qname";

/// Source pipeline name.
pub const SRC_NAME: &str = "dns-tapir";

/// Lifetime advertised for an added domain, in seconds.
const DOMAIN_TTL: u32 = 3600;

/// An observation kind known to the pipeline, with its tag bit, the KV
/// bucket observations of that kind live in, and the marker lifetime
/// downstream applies to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationKind {
    pub name: &'static str,
    pub flag: u32,
    pub bucket: &'static str,
    pub ttl_secs: u64,
}

/// Registry of observation kinds. Micro-analysts use the entry they emit;
/// the observation encoder can walk the whole table.
pub const OBSERVATION_KINDS: &[ObservationKind] = &[
    ObservationKind {
        name: "globally_new",
        flag: TAG_GLOBALLY_NEW,
        bucket: "globally_new",
        ttl_secs: 7200,
    },
    ObservationKind {
        name: "looptest",
        flag: 1024,
        bucket: "looptest",
        ttl_secs: 3600,
    },
];

/// Look up an observation kind by name.
pub fn observation_kind(name: &str) -> Result<&'static ObservationKind, DomainError> {
    OBSERVATION_KINDS
        .iter()
        .find(|k| k.name == name)
        .ok_or_else(|| DomainError::UnknownObservation {
            kind: name.to_string(),
        })
}

/// A domain entry inside an observation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedDomain {
    pub name: String,
    pub time_added: DateTime<Utc>,
    pub ttl: u32,
    pub tag_mask: u32,
    pub extended_tags: Vec<String>,
}

/// The observation document published for downstream list builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapirMessage {
    pub src_name: String,
    pub creator: String,
    pub msg_type: String,
    pub list_type: String,
    pub added: Vec<ObservedDomain>,
    pub removed: Vec<ObservedDomain>,
    pub timestamp: DateTime<Utc>,
}

impl TapirMessage {
    /// Build an observation declaring one added domain with the given tag
    /// bits set.
    pub fn observation(domain: &DomainName, flags: u32, now: DateTime<Utc>) -> Self {
        Self {
            src_name: SRC_NAME.to_string(),
            creator: CREATOR.to_string(),
            msg_type: "observation".to_string(),
            list_type: "doubtlist".to_string(),
            added: vec![ObservedDomain {
                name: domain.as_str().to_string(),
                time_added: now,
                ttl: DOMAIN_TTL,
                tag_mask: flags,
                extended_tags: Vec::new(),
            }],
            removed: Vec::new(),
            timestamp: now,
        }
    }
}
