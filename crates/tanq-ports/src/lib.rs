//! tapir-analyse-new-qname port traits
//!
//! This crate defines the capability boundaries the analyst core depends
//! on. Concrete implementations live in `tanq-adapters` and are injected at
//! startup:
//! - `EventBus`: the message bus with its domain-keyed KV stores
//! - `TapirCodec`: payload decoding and observation encoding
//! - `Validator`: optional JSON-schema validation of event payloads
//! - `Clock`: time source, swappable in tests

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tanq_domain::{DomainError, DomainName};

/// Header naming the reporter's key.
pub const HEADER_KEY_IDENTIFIER: &str = "DNSTAPIR-Key-Identifier";

/// Header carrying the reporter's key thumbprint. Required; events without
/// it are discarded.
pub const HEADER_KEY_THUMBPRINT: &str = "DNSTAPIR-Key-Thumbprint";

/// The headers copied from bus messages into [`BusMessage::headers`].
/// Everything else is dropped at the adapter boundary.
pub const SIGNIFICANT_HEADERS: &[&str] = &[HEADER_KEY_IDENTIFIER, HEADER_KEY_THUMBPRINT];

/// A normalized message from the event subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Whitelisted headers; multi-valued headers collapse to the first value.
    pub headers: HashMap<String, String>,
    /// Raw payload bytes.
    pub data: Bytes,
}

impl BusMessage {
    /// The reporter thumbprint header, if present.
    pub fn thumbprint(&self) -> Option<&str> {
        self.headers.get(HEADER_KEY_THUMBPRINT).map(String::as_str)
    }
}

/// Message bus port: the event subscription plus domain-keyed operations
/// against the `seen_domains`, `globally_new`, and private KV stores.
pub trait EventBus: Send + Sync {
    /// Activate the event subscription.
    ///
    /// Returns a bounded channel of normalized messages. The channel closes
    /// when `cancel` fires or the underlying subscription terminates; the
    /// adapter unsubscribes exactly once after close. Messages are
    /// acknowledged on dequeue, fire-and-forget.
    fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<BusMessage>, BusError>> + Send;

    /// Record that `reporter` has seen `domain`.
    ///
    /// Returns whether the domain already existed in the `seen_domains`
    /// store. Exactly one concurrent caller per domain observes `false`,
    /// fleet-wide; that caller owns the globally-new follow-up.
    fn add_domain(
        &self,
        cancel: &CancellationToken,
        domain: &DomainName,
        reporter: &str,
    ) -> impl Future<Output = Result<bool, BusError>> + Send;

    /// Mark `domain` globally new. Idempotent: a repeat call refreshes the
    /// existing entry in place.
    fn set_observation_globally_new(
        &self,
        cancel: &CancellationToken,
        domain: &DomainName,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Refresh the TTL-bounded per-edge marker for `(domain, reporter)` in
    /// the private store.
    fn refresh_edge_marker(
        &self,
        cancel: &CancellationToken,
        domain: &DomainName,
        reporter: &str,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Best-effort publish of an observation payload.
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Flush and close the bus connection.
    fn shutdown(&self) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Message bus errors. All per-event failures are local: the caller logs,
/// drops the event, and relies on at-least-once redelivery to converge.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("subscribe failed: {message}")]
    Subscribe { message: String },

    #[error("kv operation failed for '{key}': {message}")]
    Kv { key: String, message: String },

    #[error("revision conflict updating '{key}'")]
    RevisionConflict { key: String },

    #[error("publish to '{subject}' failed: {message}")]
    Publish { subject: String, message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

/// Codec port: payload decoding and observation encoding, the seam the
/// shared tapir library sits behind.
pub trait TapirCodec: Send + Sync {
    /// Extract and normalize the qname from an event payload.
    fn extract_domain(&self, data: &[u8]) -> Result<DomainName, CodecError>;

    /// Encode an observation message for `domain` with the given tag bits.
    fn build_observation(&self, domain: &DomainName, flags: u32) -> Result<Vec<u8>, CodecError>;
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decode failed: {0}")]
    Decode(#[from] DomainError),

    #[error("encode failed: {message}")]
    Encode { message: String },
}

/// Schema validation port. A single boolean predicate; implementations that
/// are disabled by configuration accept everything.
pub trait Validator: Send + Sync {
    fn validate(&self, data: &[u8]) -> bool;
}

/// Validator accepting every payload, used when no schema directory is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _data: &[u8]) -> bool {
        true
    }
}

/// Clock port for deterministic time handling in tests.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Current unix time in seconds.
    fn now_unix(&self) -> i64 {
        self.now().timestamp()
    }
}

/// System clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
