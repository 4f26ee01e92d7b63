//! Value serialization for the wire.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

/// A value could not be encoded or decoded.
#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Turns values into bytes and back.
///
/// Both ends of a connection must use the same codec.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_codec_is_compact() {
        let bytes = JsonCodec.encode(&json!({"a": [1, 2]})).unwrap();
        assert_eq!(&bytes[..], br#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("codec error"));
    }
}
