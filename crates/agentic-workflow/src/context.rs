//! WorkflowContext - what a handler can do while it runs.
//!
//! Provides executors with the ability to:
//! - Send messages along their outgoing edges (or to a specific target)
//! - Yield outputs to the workflow caller
//! - Emit custom events
//! - Request information from outside the graph
//! - Signal completion of the run
//! - Access shared state
//!
//! Everything except shared state is buffered and only takes effect once
//! the handler returns successfully; the scheduler commits it at the end of
//! the superstep.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
//!     ctx.send_message(&text.to_uppercase())?;
//!     ctx.set_shared_state("last_seen", &text).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::events::WorkflowEvent;
use crate::message::{Message, Payload, RequestResponse};
use crate::request_info::PendingRequest;
use crate::types::{ExecutorError, ExecutorId, RequestId, TypeTag, WorkflowId};

// ============================================================================
// SHARED STATE BACKEND
// ============================================================================

/// Storage behind `get_shared_state` / `set_shared_state`.
///
/// Scoped to one workflow run. Writes are last-write-wins; callers namespace
/// their keys.
#[async_trait]
pub trait SharedStateBackend: Send + Sync {
    async fn set(&self, key: &str, value: Value) -> Result<(), ExecutorError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, ExecutorError>;

    async fn delete(&self, key: &str) -> Result<(), ExecutorError>;

    /// Copy of every entry, for checkpoints.
    async fn snapshot(&self) -> Result<HashMap<String, Value>, ExecutorError>;

    /// Replace every entry, for restores and fresh runs.
    async fn replace(&self, entries: HashMap<String, Value>) -> Result<(), ExecutorError>;
}

/// In-memory shared state.
#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    state: RwLock<HashMap<String, Value>>,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SharedStateBackend for InMemoryStateBackend {
    async fn set(&self, key: &str, value: Value) -> Result<(), ExecutorError> {
        self.state.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, ExecutorError> {
        Ok(self.state.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), ExecutorError> {
        self.state.write().await.remove(key);
        Ok(())
    }

    async fn snapshot(&self) -> Result<HashMap<String, Value>, ExecutorError> {
        Ok(self.state.read().await.clone())
    }

    async fn replace(&self, entries: HashMap<String, Value>) -> Result<(), ExecutorError> {
        *self.state.write().await = entries;
        Ok(())
    }
}

// ============================================================================
// CONTEXT EFFECTS
// ============================================================================

/// Everything a handler produced, handed back to the scheduler.
#[derive(Debug, Default)]
pub(crate) struct ContextEffects {
    pub messages: Vec<Message>,
    pub outputs: Vec<Payload>,
    pub events: Vec<WorkflowEvent>,
    pub requests: Vec<PendingRequest>,
    pub completion: Option<Payload>,
}

/// Buffer lengths at a point in time, used to discard a failed handler's effects.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EffectsMark {
    messages: usize,
    outputs: usize,
    events: usize,
    requests: usize,
    completed: bool,
}

// ============================================================================
// WORKFLOW CONTEXT
// ============================================================================

/// Handed to every handler invocation.
pub struct WorkflowContext {
    workflow_id: WorkflowId,
    executor_id: ExecutorId,
    superstep: u32,
    state_backend: Arc<dyn SharedStateBackend>,
    effects: ContextEffects,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: WorkflowId,
        executor_id: ExecutorId,
        superstep: u32,
        state_backend: Arc<dyn SharedStateBackend>,
    ) -> Self {
        Self {
            workflow_id,
            executor_id,
            superstep,
            state_backend,
            effects: ContextEffects::default(),
        }
    }

    /// Create a context with in-memory state (for testing handlers directly).
    pub fn in_memory(workflow_id: WorkflowId, executor_id: ExecutorId) -> Self {
        Self::new(
            workflow_id,
            executor_id,
            0,
            Arc::new(InMemoryStateBackend::new()),
        )
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn superstep(&self) -> u32 {
        self.superstep
    }

    // ========================================================================
    // MESSAGING
    // ========================================================================

    /// Send a message along this executor's outgoing edges.
    pub fn send_message<T: Serialize>(&mut self, message: &T) -> Result<(), ExecutorError> {
        let payload = Payload::new(message)?;
        self.send_payload(payload, None);
        Ok(())
    }

    /// Send a message to one connected executor only.
    pub fn send_message_to<T: Serialize>(
        &mut self,
        message: &T,
        target: impl Into<ExecutorId>,
    ) -> Result<(), ExecutorError> {
        let payload = Payload::new(message)?;
        self.send_payload(payload, Some(target.into()));
        Ok(())
    }

    /// Send an already-tagged payload, e.g. when forwarding.
    pub fn send_payload(&mut self, payload: Payload, target: Option<ExecutorId>) {
        self.effects
            .messages
            .push(Message::new(payload, self.executor_id.clone(), target));
    }

    /// Yield an output visible to the workflow caller.
    pub fn yield_output<T: Serialize>(&mut self, output: &T) -> Result<(), ExecutorError> {
        let payload = Payload::new(output)?;
        self.yield_payload(payload);
        Ok(())
    }

    pub fn yield_payload(&mut self, payload: Payload) {
        self.effects.outputs.push(payload);
    }

    /// Emit a custom event.
    pub fn add_event(&mut self, event_type: &str, data: Value) {
        self.effects.events.push(WorkflowEvent::Custom {
            executor_id: self.executor_id.clone(),
            event_type: event_type.to_string(),
            data,
        });
    }

    /// Finish the whole run after the current superstep.
    pub fn complete<T: Serialize>(&mut self, result: &T) -> Result<(), ExecutorError> {
        let payload = Payload::new(result)?;
        self.complete_with_payload(payload);
        Ok(())
    }

    /// The first completion of a handler wins; later ones are ignored.
    pub fn complete_with_payload(&mut self, payload: Payload) {
        if self.effects.completion.is_none() {
            self.effects.completion = Some(payload);
        }
    }

    // ========================================================================
    // REQUEST INFO
    // ========================================================================

    /// Ask the caller for a `Resp`.
    ///
    /// The answer arrives later as a `RequestResponse<Req, Resp>` message, so
    /// the executor must register a handler for that type.
    pub fn request_info<Req, Resp>(&mut self, request: &Req) -> Result<RequestId, ExecutorError>
    where
        Req: Serialize + DeserializeOwned + Send + 'static,
        Resp: Serialize + DeserializeOwned + Send + 'static,
    {
        let pending = PendingRequest {
            request_id: RequestId::generate(),
            source_executor_id: self.executor_id.clone(),
            request_type: TypeTag::of::<Req>(),
            response_type: TypeTag::of::<Resp>(),
            response_message_type: TypeTag::of::<RequestResponse<Req, Resp>>(),
            data: serde_json::to_value(request)?,
            created_at: Utc::now(),
        };
        let request_id = pending.request_id.clone();
        self.effects.requests.push(pending);
        Ok(request_id)
    }

    /// Re-raise a request under this executor's name.
    pub(crate) fn raise_request(&mut self, request: PendingRequest) {
        self.effects.requests.push(request);
    }

    // ========================================================================
    // SHARED STATE
    // ========================================================================

    /// Set a value in shared state. Visible to other executors immediately.
    pub async fn set_shared_state<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), ExecutorError> {
        let json = serde_json::to_value(value).map_err(|e| {
            ExecutorError::internal(format!("Failed to serialize shared state: {e}"))
        })?;
        self.state_backend.set(key, json).await
    }

    /// Get a value from shared state.
    pub async fn get_shared_state<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ExecutorError> {
        match self.state_backend.get(key).await? {
            Some(json) => {
                let value = serde_json::from_value(json).map_err(|e| {
                    ExecutorError::internal(format!("Failed to deserialize shared state: {e}"))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Delete a value from shared state.
    pub async fn delete_shared_state(&self, key: &str) -> Result<(), ExecutorError> {
        self.state_backend.delete(key).await
    }

    // ========================================================================
    // EFFECTS
    // ========================================================================

    pub(crate) fn mark(&self) -> EffectsMark {
        EffectsMark {
            messages: self.effects.messages.len(),
            outputs: self.effects.outputs.len(),
            events: self.effects.events.len(),
            requests: self.effects.requests.len(),
            completed: self.effects.completion.is_some(),
        }
    }

    /// Drop everything buffered after `mark`.
    pub(crate) fn rollback(&mut self, mark: EffectsMark) {
        self.effects.messages.truncate(mark.messages);
        self.effects.outputs.truncate(mark.outputs);
        self.effects.events.truncate(mark.events);
        self.effects.requests.truncate(mark.requests);
        if !mark.completed {
            self.effects.completion = None;
        }
    }

    pub(crate) fn into_effects(self) -> ContextEffects {
        self.effects
    }

    /// Drain sent messages (for testing handlers directly).
    pub fn drain_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.effects.messages)
    }

    /// Drain yielded outputs.
    pub fn drain_outputs(&mut self) -> Vec<Payload> {
        std::mem::take(&mut self.effects.outputs)
    }

    /// Drain custom events.
    pub fn drain_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.effects.events)
    }

    /// Drain raised requests.
    pub fn drain_requests(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.effects.requests)
    }

    pub fn completion(&self) -> Option<&Payload> {
        self.effects.completion.as_ref()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> WorkflowContext {
        WorkflowContext::in_memory(WorkflowId::new("wf-test"), ExecutorId::new("exe-test"))
    }

    #[test]
    fn test_send_message() {
        let mut ctx = test_ctx();
        ctx.send_message(&"Hello".to_string()).unwrap();
        ctx.send_message_to(&"World".to_string(), "other").unwrap();

        let messages = ctx.drain_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload.decode::<String>(), Some("Hello".into()));
        assert_eq!(messages[0].source_id.as_str(), "exe-test");
        assert!(messages[0].target_id.is_none());
        assert_eq!(messages[1].target_id, Some(ExecutorId::new("other")));
    }

    #[test]
    fn test_yield_output_and_events() {
        let mut ctx = test_ctx();
        ctx.yield_output(&42u32).unwrap();
        ctx.add_event("progress", serde_json::json!({"percent": 50}));

        assert_eq!(ctx.drain_outputs()[0].decode::<u32>(), Some(42));
        let events = ctx.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WorkflowEvent::Custom { event_type, .. } if event_type == "progress"
        ));
    }

    #[test]
    fn test_request_info_records_types() {
        let mut ctx = test_ctx();
        let id = ctx
            .request_info::<String, bool>(&"deploy?".to_string())
            .unwrap();

        let requests = ctx.drain_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id, id);
        assert_eq!(requests[0].request_type, TypeTag::of::<String>());
        assert_eq!(requests[0].response_type, TypeTag::of::<bool>());
        assert_eq!(
            requests[0].response_message_type,
            TypeTag::of::<RequestResponse<String, bool>>()
        );
    }

    #[test]
    fn test_rollback_discards_effects_after_mark() {
        let mut ctx = test_ctx();
        ctx.send_message(&1u32).unwrap();
        let mark = ctx.mark();
        ctx.send_message(&2u32).unwrap();
        ctx.yield_output(&"partial".to_string()).unwrap();
        ctx.complete(&"done".to_string()).unwrap();

        ctx.rollback(mark);
        let effects = ctx.into_effects();
        assert_eq!(effects.messages.len(), 1);
        assert!(effects.outputs.is_empty());
        assert!(effects.completion.is_none());
    }

    #[tokio::test]
    async fn test_shared_state() {
        let ctx = test_ctx();

        ctx.set_shared_state("counter", &42i32).await.unwrap();
        let value: Option<i32> = ctx.get_shared_state("counter").await.unwrap();
        assert_eq!(value, Some(42));

        let missing: Option<String> = ctx.get_shared_state("missing").await.unwrap();
        assert!(missing.is_none());

        ctx.delete_shared_state("counter").await.unwrap();
        let deleted: Option<i32> = ctx.get_shared_state("counter").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_shared_state_between_contexts() {
        let backend: Arc<dyn SharedStateBackend> = Arc::new(InMemoryStateBackend::new());
        let wf_id = WorkflowId::new("wf-shared");

        let ctx1 = WorkflowContext::new(wf_id.clone(), ExecutorId::new("exe-1"), 0, backend.clone());
        ctx1.set_shared_state("status", "processing").await.unwrap();

        let ctx2 = WorkflowContext::new(wf_id, ExecutorId::new("exe-2"), 1, backend.clone());
        let status: Option<String> = ctx2.get_shared_state("status").await.unwrap();
        assert_eq!(status, Some("processing".to_string()));

        let snapshot = backend.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        backend.replace(HashMap::new()).await.unwrap();
        assert!(backend.get("status").await.unwrap().is_none());
    }
}
