//! Frame serializer seam
//!
//! Transit hands every outgoing envelope to an injected serializer and
//! feeds every received byte slice back through it. Implementations must
//! be round-trip stable for all frame kinds; the JSON one below is the
//! built-in default, alternative codecs plug in through the same trait.

use flock_types::{BrokerError, Envelope};

pub trait Serializer: Send + Sync + std::fmt::Debug {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, BrokerError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, BrokerError>;
    fn name(&self) -> &'static str;
}

/// JSON wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(envelope).map_err(|e| BrokerError::serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::serialization(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_types::FramePayload;

    #[test]
    fn test_round_trip() {
        let serializer = JsonSerializer;
        let envelope = Envelope::new("node-1", FramePayload::Discover);

        let bytes = serializer.serialize(&envelope).unwrap();
        let back = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let serializer = JsonSerializer;
        let err = serializer.deserialize(b"{nope").unwrap_err();
        assert!(matches!(err, BrokerError::Serialization { .. }));
    }
}
