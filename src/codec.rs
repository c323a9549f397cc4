//! Application payload codec.

/// Maps typed values to wire bytes and back.
///
/// Decoders may fail on arbitrary input; the runtime logs the failure and
/// drops the frame.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>>;
    fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

/// Default codec: UTF-8 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let bytes = codec.encode(&serde_json::json!({ "val": 21 })).unwrap();
        let value: serde_json::Value = codec.decode(&bytes).unwrap();
        assert_eq!(value, serde_json::json!({ "val": 21 }));
    }

    #[test]
    fn json_decode_failure() {
        let codec = JsonCodec;
        let result = codec.decode::<serde_json::Value>(b"not json");
        assert!(result.is_err());
    }
}
