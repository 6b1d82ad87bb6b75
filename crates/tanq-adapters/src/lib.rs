//! tapir-analyse-new-qname adapter implementations
//!
//! Concrete implementations of the ports in `tanq-ports`:
//! - NATS JetStream message bus with the `seen_domains` / `globally_new` /
//!   private KV stores
//! - The libtapir codec (event decoding, observation encoding)
//! - JSON-schema payload validation
//! - The admin-TLS certificate manager with SNI resolution

pub mod cert;
pub mod codec;
pub mod nats;
pub mod schema;

pub use cert::{CertManager, CertManagerConfig, CertResolver};
pub use codec::LibTapir;
pub use nats::{NatsConfig, NatsEventBus};
pub use schema::SchemaValidator;
