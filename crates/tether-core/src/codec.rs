//! Pluggable wire codecs.
//!
//! The dispatch engine works on [`serde_json::Value`] trees; a [`WireCodec`]
//! turns those trees into bytes and back. Request heads have their own
//! [`HeadCodec`] because they travel in an HTTP header rather than the body.
//! [`JsonCodec`] implements both and is the default.

use crate::protocol::RpcHead;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// Codec failure.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("missing argument: {0}")]
    MissingArgument(String),
}

/// Serializes argument lists, return values and event payloads.
pub trait WireCodec: Send + Sync + 'static {
    /// Stable identifier of the format.
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Serializes the out-of-band request head.
pub trait HeadCodec: Send + Sync + 'static {
    fn encode_head(&self, head: &RpcHead) -> Result<String, CodecError>;

    fn decode_head(&self, raw: &str) -> Result<RpcHead, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl HeadCodec for JsonCodec {
    fn encode_head(&self, head: &RpcHead) -> Result<String, CodecError> {
        serde_json::to_string(head).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_head(&self, raw: &str) -> Result<RpcHead, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Encode an argument list as a map keyed by parameter name.
pub fn encode_arguments(
    codec: &dyn WireCodec,
    names: &[&str],
    values: &[Value],
) -> Result<Vec<u8>, CodecError> {
    if names.len() != values.len() {
        return Err(CodecError::Encode(format!(
            "expected {} arguments, got {}",
            names.len(),
            values.len()
        )));
    }
    let map: Map<String, Value> = names
        .iter()
        .zip(values)
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    codec.encode(&Value::Object(map))
}

/// Decode an argument map back into positional order.
///
/// An empty body is accepted for a parameterless method.
pub fn decode_arguments(
    codec: &dyn WireCodec,
    bytes: &[u8],
    names: &[&str],
) -> Result<Vec<Value>, CodecError> {
    if names.is_empty() && bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let mut map = match codec.decode(bytes)? {
        Value::Object(map) => map,
        other => {
            return Err(CodecError::Decode(format!(
                "argument list must be a map, got {}",
                kind_of(&other)
            )))
        }
    };
    names
        .iter()
        .map(|name| {
            map.remove(*name)
                .ok_or_else(|| CodecError::MissingArgument(name.to_string()))
        })
        .collect()
}

/// Convert a decoded value tree into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Convert a positional argument list into a typed tuple (or single value).
///
/// Parameterless methods decode `()` from an empty list.
pub fn from_arguments<T: DeserializeOwned>(args: Vec<Value>) -> Result<T, CodecError> {
    if args.is_empty() {
        if let Ok(unit) = serde_json::from_value(Value::Null) {
            return Ok(unit);
        }
    }
    serde_json::from_value(Value::Array(args)).map_err(|e| CodecError::Decode(e.to_string()))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arguments_keep_positional_order() {
        let codec = JsonCodec;
        let bytes = encode_arguments(&codec, &["a", "b"], &[json!(2), json!(3)]).unwrap();
        let decoded = decode_arguments(&codec, &bytes, &["b", "a"]).unwrap();
        assert_eq!(decoded, vec![json!(3), json!(2)]);
    }

    #[test]
    fn test_argument_count_mismatch() {
        let err = encode_arguments(&JsonCodec, &["a"], &[]).unwrap_err();
        assert!(matches!(err, CodecError::Encode(_)));
    }

    #[test]
    fn test_missing_argument() {
        let err = decode_arguments(&JsonCodec, br#"{"a":1}"#, &["a", "b"]).unwrap_err();
        assert!(matches!(err, CodecError::MissingArgument(name) if name == "b"));
    }

    #[test]
    fn test_empty_body_for_parameterless_method() {
        assert!(decode_arguments(&JsonCodec, b"", &[]).unwrap().is_empty());
        assert!(decode_arguments(&JsonCodec, b"", &["a"]).is_err());
    }

    #[test]
    fn test_non_map_body_rejected() {
        let err = decode_arguments(&JsonCodec, b"[1,2]", &["a"]).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_from_arguments_shapes() {
        let (a, b): (i32, i32) = from_arguments(vec![json!(2), json!(3)]).unwrap();
        assert_eq!((a, b), (2, 3));
        let unit: () = from_arguments(Vec::new()).unwrap();
        assert_eq!(unit, ());
        let (s,): (String,) = from_arguments(vec![json!("x")]).unwrap();
        assert_eq!(s, "x");
    }
}
