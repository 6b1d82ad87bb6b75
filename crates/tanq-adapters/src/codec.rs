//! libtapir codec adapter
//!
//! Thin adapter putting the shared tapir message formats behind the
//! `TapirCodec` port: qname extraction from `new_qname` events and
//! observation-message encoding.

use tracing::debug;

use tanq_domain::{DomainName, NewQnameEvent, TapirMessage};
use tanq_ports::{Clock, CodecError, SystemClock, TapirCodec};

/// Codec over the tapir wire formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibTapir<C = SystemClock> {
    clock: C,
}

impl LibTapir<SystemClock> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> LibTapir<C> {
    /// Codec with an injected clock, for deterministic observation
    /// timestamps in tests.
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> TapirCodec for LibTapir<C> {
    fn extract_domain(&self, data: &[u8]) -> Result<DomainName, CodecError> {
        let domain = NewQnameEvent::extract_domain(data)?;
        debug!(domain = %domain, "Read domain from message");
        Ok(domain)
    }

    fn build_observation(&self, domain: &DomainName, flags: u32) -> Result<Vec<u8>, CodecError> {
        let msg = TapirMessage::observation(domain, flags, self.clock.now());
        serde_json::to_vec(&msg).map_err(|e| CodecError::Encode {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tanq_domain::TAG_GLOBALLY_NEW;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_extract_domain() {
        let codec = LibTapir::new();
        let domain = codec
            .extract_domain(br#"{"qname": "wanted.xa."}"#)
            .unwrap();
        assert_eq!(domain.as_str(), "wanted.xa");
    }

    #[test]
    fn test_extract_rejects_unknown_fields() {
        let codec = LibTapir::new();
        assert!(codec
            .extract_domain(br#"{"qname": "x.test", "bogus": true}"#)
            .is_err());
    }

    #[test]
    fn test_build_observation() {
        let now = "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let codec = LibTapir::with_clock(FixedClock(now));
        let domain = DomainName::parse("lala.xa").unwrap();

        let bytes = codec.build_observation(&domain, TAG_GLOBALLY_NEW).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["msg_type"], "observation");
        assert_eq!(value["added"][0]["name"], "lala.xa");
        assert_eq!(value["added"][0]["tag_mask"], 2048);
    }
}
