//! Binary codec for network message serialization.
//!
//! Centralized encoding and decoding of wire data using bincode, so the
//! configuration lives in exactly one place. Fixed-size integer encoding keeps
//! message sizes deterministic, which matters when sizing chunked payloads.

use serde::{de::DeserializeOwned, Serialize};

use crate::HeliographError;

// Standard config with fixed-int encoding: deterministic sizes, no
// variable-length overhead for the small integers that dominate our messages.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encodes any serde-serializable value into a byte vector.
///
/// # Errors
/// Returns [`HeliographError::SerializationError`] if bincode fails, which
/// indicates a fundamental issue with the type being serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, HeliographError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| {
        HeliographError::SerializationError {
            context: format!("bincode encode failed: {e}"),
        }
    })
}

/// Decodes a value from a byte slice. Returns the value and the number of
/// bytes read.
///
/// # Errors
/// Returns [`HeliographError::SerializationError`] on malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), HeliographError> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| {
        HeliographError::SerializationError {
            context: format!("bincode decode failed: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_primitive() {
        let bytes = encode(&42u32).expect("encode");
        let (decoded, read): (u32, usize) = decode(&bytes).expect("decode");
        assert_eq!(decoded, 42);
        assert_eq!(read, bytes.len());
    }

    #[test]
    fn roundtrip_vec() {
        let value = vec![1u16, 2, 3, 500];
        let bytes = encode(&value).expect("encode");
        let (decoded, _): (Vec<u16>, usize) = decode(&bytes).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_garbage_fails() {
        let result: Result<(Vec<String>, usize), _> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn fixed_int_encoding_is_size_deterministic() {
        // both values encode to the same number of bytes
        let small = encode(&1u64).expect("encode");
        let large = encode(&u64::MAX).expect("encode");
        assert_eq!(small.len(), large.len());
    }
}
