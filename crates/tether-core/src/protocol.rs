//! Shared protocol types and event-socket framing.
//!
//! Unary calls travel as an HTTP POST whose `meta` header carries an
//! [`RpcHead`] and whose body carries the argument map. Event callbacks travel
//! over a WebSocket as binary frames:
//!
//! ```text
//! [u32 LE: handler id][codec payload]
//! ```
//!
//! Server to client the payload is an [`EventPayload`]; client to server it is
//! an [`EventReply`].

use crate::codec::{CodecError, WireCodec};
use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Stable method identifier agreed through the shared interface contract.
pub type MethodKey = u32;

/// Correlation id routing a pushed invocation to a client-side handler.
pub type HandlerId = u32;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-wide request id.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Out-of-band request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHead {
    pub namespace: String,
    pub type_name: String,
    pub method_name: String,
    pub method_key: MethodKey,
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub event_op: bool,
    /// Invocation deadline in milliseconds.
    pub timeout_ms: u64,
}

impl RpcHead {
    /// `namespace.TypeName`
    pub fn interface_name(&self) -> String {
        format!("{}.{}", self.namespace, self.type_name)
    }
}

/// One remote operation as built by the client dispatcher.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: u64,
    pub head: RpcHead,
    pub arguments: Vec<Value>,
}

impl RpcRequest {
    pub fn new(head: RpcHead, arguments: Vec<Value>) -> Self {
        Self {
            id: next_request_id(),
            head,
            arguments,
        }
    }
}

/// Server-to-client event invocation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub types: Vec<String>,
    pub args: Vec<Value>,
}

/// Client-to-server event result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReply {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl EventReply {
    pub fn value(value: Value) -> Self {
        Self { value, error: None }
    }

    pub fn error(error: RpcError) -> Self {
        Self {
            value: Value::Null,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}

/// Prefix a payload with its handler id.
pub fn encode_frame(handler_id: HandlerId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&handler_id.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into its handler id and payload.
pub fn decode_frame(frame: &[u8]) -> Result<(HandlerId, &[u8]), CodecError> {
    if frame.len() < 4 {
        return Err(CodecError::Decode(format!(
            "event frame too short: {} bytes",
            frame.len()
        )));
    }
    let (id, payload) = frame.split_at(4);
    let handler_id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
    Ok((handler_id, payload))
}

/// Encode a serializable payload into a complete frame.
pub fn encode_event_frame<T: Serialize>(
    codec: &dyn WireCodec,
    handler_id: HandlerId,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(encode_frame(handler_id, &codec.encode(&value)?))
}

/// Decode a frame into its handler id and typed payload.
pub fn decode_event_frame<T: serde::de::DeserializeOwned>(
    codec: &dyn WireCodec,
    frame: &[u8],
) -> Result<(HandlerId, T), CodecError> {
    let (handler_id, payload) = decode_frame(frame)?;
    let value = codec.decode(payload)?;
    Ok((handler_id, crate::codec::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    #[test]
    fn test_frame_prefix_is_little_endian() {
        let frame = encode_frame(0x0102_0304, b"xy");
        assert_eq!(&frame[..4], &[0x04, 0x03, 0x02, 0x01]);
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, 0x0102_0304);
        assert_eq!(payload, b"xy");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(decode_frame(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_event_frame_payload() {
        let payload = EventPayload {
            types: vec!["string".into()],
            args: vec![json!("x")],
        };
        let frame = encode_event_frame(&JsonCodec, 42, &payload).unwrap();
        let (id, decoded): (HandlerId, EventPayload) = decode_event_frame(&JsonCodec, &frame).unwrap();
        assert_eq!(id, 42);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_reply_into_result() {
        assert_eq!(EventReply::value(json!(true)).into_result(), Ok(json!(true)));
        let err = EventReply::error(RpcError::new("nope")).into_result().unwrap_err();
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn test_head_wire_names() {
        let head = RpcHead {
            namespace: "Samples".into(),
            type_name: "ICalculator".into(),
            method_name: "Add".into(),
            method_key: 1,
            instance_id: Uuid::nil(),
            token: None,
            event_op: false,
            timeout_ms: 1000,
        };
        let json = serde_json::to_value(&head).unwrap();
        assert_eq!(json["typeName"], "ICalculator");
        assert_eq!(json["methodKey"], 1);
        assert!(json.get("token").is_none());
        assert_eq!(head.interface_name(), "Samples.ICalculator");
    }

    #[test]
    fn test_request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
