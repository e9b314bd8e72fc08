//! Payload serializer seam
//!
//! Call arguments and results pass through a pluggable serializer so that
//! generated stubs can pick the codec that fits their deployment. Envelopes
//! themselves are always bincode (see `cw-protocol`); only the payload bytes
//! inside them are serializer-defined, so peers using different payload
//! codecs still interoperate at the framing layer.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializerError;

/// Converts typed call arguments/results to and from payload bytes
pub trait RpcSerializer: Send + Sync {
    /// Serialize a value into payload bytes
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Deserialize a value from payload bytes
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}

/// Compact binary payload codec; the default
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl RpcSerializer for BincodeSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Human-readable JSON payload codec, useful for debugging peers
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl RpcSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_bincode_roundtrip() {
        let value = Sample {
            name: "demo".to_string(),
            count: 3,
        };

        let bytes = BincodeSerializer.serialize(&value).unwrap();
        let decoded: Sample = BincodeSerializer.deserialize(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_json_roundtrip() {
        let value = Sample {
            name: "demo".to_string(),
            count: 3,
        };

        let bytes = JsonSerializer.serialize(&value).unwrap();
        assert!(bytes.starts_with(b"{"));

        let decoded: Sample = JsonSerializer.deserialize(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_unit_serializes_to_empty_payload() {
        // Argument-less calls send an empty payload
        let bytes = BincodeSerializer.serialize(&()).unwrap();
        assert!(bytes.is_empty());

        let _: () = BincodeSerializer.deserialize(&bytes).unwrap();
    }
}
