use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque serialized value.
///
/// Payloads are produced and consumed by a [`Converter`](crate::converter::Converter);
/// the engine itself never inspects their contents. They appear in event and
/// command attributes wherever user values cross the durable boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serde() {
        let payload = Payload::from(vec![1u8, 2, 3]);
        let encoded = serde_json::to_vec(&payload).unwrap();
        let decoded: Payload = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn default_is_empty() {
        assert!(Payload::default().is_empty());
    }
}
