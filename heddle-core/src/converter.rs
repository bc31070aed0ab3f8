//! Conversion between user values and opaque [`Payload`]s.
//!
//! The concrete converter is a type parameter threaded through registries and
//! contexts; it is captured into erased invocation wrappers at registration
//! time, so nothing downstream of a registry needs to name it.

use crate::payload::Payload;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error produced when a value cannot cross the payload boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversionError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode value: {0}")]
    Decode(String),
    #[error("expected {expected} argument payload(s), got {actual}")]
    Arity { expected: usize, actual: usize },
}

/// Converts arbitrary values to and from opaque byte payloads.
///
/// Implementations must be cheap to clone; a copy is stored in every
/// registered function wrapper.
pub trait Converter: Clone + Send + Sync + 'static {
    fn to_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload, ConversionError>;

    fn from_payload<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, ConversionError>;
}

/// The default converter: values are encoded as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn to_payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload, ConversionError> {
        let data = serde_json::to_vec(value).map_err(|e| ConversionError::Encode(e.to_string()))?;
        Ok(Payload::from(data))
    }

    fn from_payload<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, ConversionError> {
        serde_json::from_slice(payload.as_slice()).map_err(|e| ConversionError::Decode(e.to_string()))
    }
}

/// Conversion of an argument tuple into the payload list carried by schedule
/// events. Implemented for tuples up to arity four; a workflow or activity
/// taking a single value receives it as a one-element tuple.
pub trait IntoPayloads {
    fn into_payloads<C: Converter>(self, converter: &C) -> Result<Vec<Payload>, ConversionError>;
}

/// The inverse of [`IntoPayloads`], used on the invocation side.
pub trait FromPayloads: Sized {
    fn from_payloads<C: Converter>(converter: &C, payloads: &[Payload]) -> Result<Self, ConversionError>;
}

impl IntoPayloads for () {
    fn into_payloads<C: Converter>(self, _converter: &C) -> Result<Vec<Payload>, ConversionError> {
        Ok(Vec::new())
    }
}

impl FromPayloads for () {
    fn from_payloads<C: Converter>(_converter: &C, payloads: &[Payload]) -> Result<Self, ConversionError> {
        if payloads.is_empty() {
            Ok(())
        } else {
            Err(ConversionError::Arity { expected: 0, actual: payloads.len() })
        }
    }
}

macro_rules! impl_payload_tuples {
    ($count:literal => $($name:ident : $index:tt),+) => {
        impl<$($name: Serialize),+> IntoPayloads for ($($name,)+) {
            fn into_payloads<C: Converter>(self, converter: &C) -> Result<Vec<Payload>, ConversionError> {
                Ok(vec![$(converter.to_payload(&self.$index)?),+])
            }
        }

        impl<$($name: DeserializeOwned),+> FromPayloads for ($($name,)+) {
            fn from_payloads<C: Converter>(converter: &C, payloads: &[Payload]) -> Result<Self, ConversionError> {
                if payloads.len() != $count {
                    return Err(ConversionError::Arity { expected: $count, actual: payloads.len() });
                }
                Ok(($(converter.from_payload::<$name>(&payloads[$index])?,)+))
            }
        }
    };
}

impl_payload_tuples!(1 => A0: 0);
impl_payload_tuples!(2 => A0: 0, A1: 1);
impl_payload_tuples!(3 => A0: 0, A1: 1, A2: 2);
impl_payload_tuples!(4 => A0: 0, A1: 1, A2: 2, A3: 3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let converter = JsonConverter;
        let payload = converter.to_payload(&42i32).unwrap();
        let value: i32 = converter.from_payload(&payload).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn tuple_round_trip() {
        let converter = JsonConverter;
        let payloads = (1i32, "two".to_string()).into_payloads(&converter).unwrap();
        assert_eq!(payloads.len(), 2);

        let (a, b): (i32, String) = FromPayloads::from_payloads(&converter, &payloads).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, "two");
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let converter = JsonConverter;
        let payloads = (1i32,).into_payloads(&converter).unwrap();
        let result = <(i32, i32)>::from_payloads(&converter, &payloads);
        assert!(matches!(result, Err(ConversionError::Arity { expected: 2, actual: 1 })));
    }

    #[test]
    fn decode_error_reports_cause() {
        let converter = JsonConverter;
        let payload = Payload::from(b"not json".to_vec());
        let err = converter.from_payload::<i32>(&payload).unwrap_err();
        assert!(matches!(err, ConversionError::Decode(_)));
    }
}
