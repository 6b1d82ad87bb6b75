//! The `new_qname` event payload
//!
//! One event is published per distinct qname observed by an edge resolver.
//! The payload is JSON produced by the edge's DNS monitor; everything except
//! the qname itself is advisory. Decoding rejects unknown fields so that a
//! schema drift on the edge side surfaces here instead of being silently
//! swallowed.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::DomainError;
use crate::name::DomainName;

/// Wire form of a `new_qname` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewQnameEvent {
    /// The queried name, possibly with a trailing dot.
    pub qname: String,

    #[serde(default)]
    pub flags: Option<u32>,
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub qclass: Option<u16>,
    #[serde(default)]
    pub qtype: Option<u16>,
    #[serde(default)]
    pub rdlength: Option<u16>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub msg_type: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
}

impl NewQnameEvent {
    /// Decode an event payload and return the normalized qname.
    pub fn extract_domain(data: &[u8]) -> Result<DomainName, DomainError> {
        let event: NewQnameEvent =
            serde_json::from_slice(data).map_err(|e| DomainError::Decode {
                reason: e.to_string(),
            })?;
        DomainName::parse(&event.qname)
    }
}
