//! Domain errors

use thiserror::Error;

/// Errors produced by the pure domain layer.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("empty domain name")]
    EmptyDomain,

    #[error("payload decode failed: {reason}")]
    Decode { reason: String },

    #[error("unknown observation kind: {kind}")]
    UnknownObservation { kind: String },
}
