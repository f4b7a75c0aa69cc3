//! Payload serialization seam.
//!
//! The transport moves opaque payload bytes; what those bytes mean is the
//! caller's business. The [`Serializer`] trait lets applications plug in an
//! encoding for metadata and message payloads, with [`BincodeSerializer`] as
//! the default.

use bincode::{
    config,
    error::{DecodeError, EncodeError},
    serde::{decode_from_slice, encode_to_vec},
};
use bytes::Bytes;
use thiserror::Error;

/// Errors produced while encoding or decoding a payload value.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] EncodeError),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),
}

/// Trait for serializing and deserializing payload values.
pub trait Serializer {
    /// Serialize `value` into payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializeError::Encode`] if serialization fails.
    fn serialize<T: serde::Serialize>(&self, value: &T) -> Result<Bytes, SerializeError>;

    /// Deserialize a value from payload bytes, returning it along with the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`SerializeError::Decode`] if deserialization fails.
    fn deserialize<T: serde::de::DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<(T, usize), SerializeError>;
}

/// Default serializer using bincode's standard configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn serialize<T: serde::Serialize>(&self, value: &T) -> Result<Bytes, SerializeError> {
        Ok(Bytes::from(encode_to_vec(value, config::standard())?))
    }

    fn deserialize<T: serde::de::DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<(T, usize), SerializeError> {
        Ok(decode_from_slice(bytes, config::standard())?)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Metadata {
        path: String,
        deadline_ms: u64,
    }

    #[test]
    fn bincode_round_trips_metadata() {
        let value = Metadata {
            path: "/pkg.Service/Method".into(),
            deadline_ms: 250,
        };
        let serializer = BincodeSerializer;
        let bytes = serializer.serialize(&value).expect("encode");
        let (decoded, consumed) = serializer.deserialize::<Metadata>(&bytes).expect("decode");
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }
}
