//! Message envelopes exchanged between executors.
//!
//! Payloads travel as a [`TypeTag`] plus a JSON value so that in-flight
//! messages can be routed by type and captured in checkpoints.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecutorId, RequestId, TypeTag};

// ============================================================================
// PAYLOAD
// ============================================================================

/// A typed message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub type_tag: TypeTag,
    pub data: Value,
}

impl Payload {
    /// Serialize a value, tagging it with its concrete type.
    pub fn new<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_tag: TypeTag::of::<T>(),
            data: serde_json::to_value(value)?,
        })
    }

    pub fn from_parts(type_tag: TypeTag, data: Value) -> Self {
        Self { type_tag, data }
    }

    /// Whether this payload carries a `T`.
    pub fn is<T: ?Sized>(&self) -> bool {
        self.type_tag == TypeTag::of::<T>()
    }

    /// Decode the payload as `T`, or `None` if it carries another type.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        if !self.is::<T>() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Join payloads into one fan-in batch, preserving order.
    ///
    /// A homogeneous batch is tagged `[inner]`; a mixed one is tagged as a
    /// batch of `serde_json::Value`.
    pub fn batch(items: Vec<Payload>) -> Self {
        let inner = match items.first() {
            Some(first) if items.iter().all(|p| p.type_tag == first.type_tag) => {
                first.type_tag.clone()
            }
            _ => TypeTag::of::<Value>(),
        };
        Self {
            type_tag: TypeTag::batch(&inner),
            data: Value::Array(items.into_iter().map(|p| p.data).collect()),
        }
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

/// Envelope routed by the scheduler: `(payload, source_id, target_id?)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    pub source_id: ExecutorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ExecutorId>,
}

impl Message {
    pub fn new(payload: Payload, source_id: ExecutorId, target_id: Option<ExecutorId>) -> Self {
        Self {
            payload,
            source_id,
            target_id,
        }
    }

    pub fn is_targeted(&self) -> bool {
        self.target_id.is_some()
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Delivered to the requesting executor once the caller answers a request
/// raised with `WorkflowContext::request_info`.
///
/// Executors that raise requests register a handler for
/// `RequestResponse<Req, Resp>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponse<Req, Resp> {
    pub request_id: RequestId,
    pub original_request: Req,
    pub data: Resp,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_payload_tagging() {
        let payload = Payload::new(&Ping { n: 3 }).unwrap();
        assert!(payload.is::<Ping>());
        assert!(!payload.is::<String>());
        assert_eq!(payload.decode::<Ping>(), Some(Ping { n: 3 }));
        assert_eq!(payload.decode::<String>(), None);
    }

    #[test]
    fn test_homogeneous_batch() {
        let batch = Payload::batch(vec![
            Payload::new(&"a".to_string()).unwrap(),
            Payload::new(&"b".to_string()).unwrap(),
        ]);
        assert_eq!(batch.type_tag, TypeTag::batch_of::<String>());
        assert_eq!(batch.data, serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_mixed_batch_falls_back_to_value() {
        let batch = Payload::batch(vec![
            Payload::new(&1u32).unwrap(),
            Payload::new(&"b".to_string()).unwrap(),
        ]);
        assert_eq!(batch.type_tag, TypeTag::batch_of::<Value>());
    }

    #[test]
    fn test_request_response_shape() {
        let response = RequestResponse {
            request_id: RequestId::new("req-1"),
            original_request: Ping { n: 1 },
            data: true,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["original_request"]["n"], 1);
        assert_eq!(value["data"], true);
    }
}
