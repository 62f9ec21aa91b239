//! RequestInfo: suspending a branch until an external caller answers.
//!
//! A request is plain data. The pending table survives checkpoints, so a
//! run can be resumed from storage and answered later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::message::Payload;
use crate::types::{CorrelationError, ExecutorId, RequestId, TypeTag};

/// Responses keyed by the request they answer.
pub type Responses = HashMap<RequestId, Value>;

// ============================================================================
// PENDING REQUEST
// ============================================================================

/// An outstanding request for external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    /// Executor whose handler receives the response.
    pub source_executor_id: ExecutorId,
    pub request_type: TypeTag,
    pub response_type: TypeTag,
    /// Tag of the message the response is delivered as.
    pub response_message_type: TypeTag,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl PendingRequest {
    /// Wrap a caller's answer as the message delivered to the requester.
    pub fn response_payload(&self, response: Value) -> Payload {
        Payload::from_parts(
            self.response_message_type.clone(),
            serde_json::json!({
                "request_id": self.request_id,
                "original_request": self.data,
                "data": response,
            }),
        )
    }
}

// ============================================================================
// PENDING REQUEST TABLE
// ============================================================================

/// `request_id → request`, at most one entry per id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingRequestTable {
    entries: BTreeMap<RequestId, PendingRequest>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: PendingRequest) -> Result<(), CorrelationError> {
        if self.entries.contains_key(&request.request_id) {
            return Err(CorrelationError::DuplicateRequest(request.request_id));
        }
        self.entries.insert(request.request_id.clone(), request);
        Ok(())
    }

    pub fn get(&self, request_id: &RequestId) -> Option<&PendingRequest> {
        self.entries.get(request_id)
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Resolve a request. Unknown and already-resolved ids are errors.
    pub fn resolve(&mut self, request_id: &RequestId) -> Result<PendingRequest, CorrelationError> {
        self.entries
            .remove(request_id)
            .ok_or_else(|| CorrelationError::UnknownRequest(request_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.entries.values()
    }

    pub fn to_vec(&self) -> Vec<PendingRequest> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Rebuild the table from a checkpoint.
    pub fn from_requests(
        requests: impl IntoIterator<Item = PendingRequest>,
    ) -> Result<Self, CorrelationError> {
        let mut table = Self::new();
        for request in requests {
            table.insert(request)?;
        }
        Ok(table)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> PendingRequest {
        PendingRequest {
            request_id: RequestId::new(id),
            source_executor_id: ExecutorId::new("reviewer"),
            request_type: TypeTag::of::<String>(),
            response_type: TypeTag::of::<bool>(),
            response_message_type: TypeTag::new("RequestResponse<String, bool>"),
            data: serde_json::json!("approve?"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_resolve() {
        let mut table = PendingRequestTable::new();
        table.insert(request("req-1")).unwrap();
        table.insert(request("req-2")).unwrap();
        assert_eq!(table.len(), 2);

        let resolved = table.resolve(&RequestId::new("req-1")).unwrap();
        assert_eq!(resolved.source_executor_id.as_str(), "reviewer");
        assert_eq!(table.len(), 1);
        assert!(table.contains(&RequestId::new("req-2")));
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut table = PendingRequestTable::new();
        table.insert(request("req-1")).unwrap();
        let err = table.insert(request("req-1")).unwrap_err();
        assert_eq!(err, CorrelationError::DuplicateRequest(RequestId::new("req-1")));
    }

    #[test]
    fn test_resolving_twice_is_an_error() {
        let mut table = PendingRequestTable::new();
        table.insert(request("req-1")).unwrap();
        table.insert(request("req-2")).unwrap();

        table.resolve(&RequestId::new("req-1")).unwrap();
        let err = table.resolve(&RequestId::new("req-1")).unwrap_err();
        assert_eq!(err, CorrelationError::UnknownRequest(RequestId::new("req-1")));
        assert!(table.contains(&RequestId::new("req-2")));
    }

    #[test]
    fn test_response_payload() {
        let pending = request("req-9");
        let payload = pending.response_payload(serde_json::json!(true));
        assert_eq!(payload.type_tag, pending.response_message_type);
        assert_eq!(payload.data["request_id"], "req-9");
        assert_eq!(payload.data["original_request"], "approve?");
        assert_eq!(payload.data["data"], true);
    }

    #[test]
    fn test_table_round_trips_through_requests() {
        let mut table = PendingRequestTable::new();
        table.insert(request("req-1")).unwrap();
        let rebuilt = PendingRequestTable::from_requests(table.to_vec()).unwrap();
        assert_eq!(rebuilt, table);
    }
}
