//! Executor - A node in the workflow graph.
//!
//! An executor is a stateful unit with one handler per concrete message
//! type. Handlers are declared up front in [`Executor::register`] and
//! stored in a [`HandlerRegistry`]; registering a second handler for the
//! same type is an error at registration time.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Upper { id: ExecutorId }
//!
//! impl Executor for Upper {
//!     fn id(&self) -> &ExecutorId { &self.id }
//!
//!     fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
//!         handlers.on::<String>()?;
//!         Ok(())
//!     }
//! }
//!
//! #[async_trait]
//! impl Handler<String> for Upper {
//!     async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
//!         ctx.send_message(&text.to_uppercase())
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;

use crate::context::WorkflowContext;
use crate::message::Payload;
use crate::request_info::PendingRequest;
use crate::types::{BuildError, ExecutorError, ExecutorId, TypeTag};

// ============================================================================
// EXECUTOR TRAITS
// ============================================================================

/// Handles one concrete message type.
#[async_trait]
pub trait Handler<M: Send + 'static>: Send {
    async fn handle(&mut self, message: M, ctx: &mut WorkflowContext) -> Result<(), ExecutorError>;
}

/// A stateful node in the graph.
///
/// Executors holding progress (counters, partial results) must implement
/// both checkpoint hooks to resume correctly.
pub trait Executor: Send + Sync + Sized + 'static {
    /// Unique id within a graph.
    fn id(&self) -> &ExecutorId;

    /// Declare the message types this executor handles.
    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError>;

    /// Human-readable description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Capture private state. `None` means nothing to persist.
    fn on_checkpoint_save(&self) -> Result<Option<Value>, ExecutorError> {
        Ok(None)
    }

    /// Restore private state captured by `on_checkpoint_save`.
    fn on_checkpoint_restore(&mut self, state: Value) -> Result<(), ExecutorError> {
        let _ = state;
        Ok(())
    }
}

// ============================================================================
// HANDLER REGISTRY
// ============================================================================

#[async_trait]
trait ErasedHandler<E: Send>: Send + Sync {
    async fn call(
        &self,
        executor: &mut E,
        payload: Payload,
        ctx: &mut WorkflowContext,
    ) -> Result<(), ExecutorError>;

    /// Whether `data` decodes into the handled type.
    fn check(&self, data: &Value) -> Result<(), String>;
}

struct TypedHandler<M>(PhantomData<fn() -> M>);

#[async_trait]
impl<E, M> ErasedHandler<E> for TypedHandler<M>
where
    E: Handler<M> + Send,
    M: DeserializeOwned + Send + 'static,
{
    async fn call(
        &self,
        executor: &mut E,
        payload: Payload,
        ctx: &mut WorkflowContext,
    ) -> Result<(), ExecutorError> {
        let message: M = serde_json::from_value(payload.data).map_err(|e| {
            ExecutorError::new(
                ctx.executor_id().clone(),
                format!("Failed to decode '{}': {e}", payload.type_tag),
            )
        })?;
        Handler::<M>::handle(executor, message, ctx).await
    }

    fn check(&self, data: &Value) -> Result<(), String> {
        serde_json::from_value::<M>(data.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

struct CatchAllHandler;

#[async_trait]
impl<E> ErasedHandler<E> for CatchAllHandler
where
    E: Handler<Payload> + Send,
{
    async fn call(
        &self,
        executor: &mut E,
        payload: Payload,
        ctx: &mut WorkflowContext,
    ) -> Result<(), ExecutorError> {
        Handler::<Payload>::handle(executor, payload, ctx).await
    }

    fn check(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Type → handler table for one executor.
pub struct HandlerRegistry<E: Send> {
    executor_id: ExecutorId,
    handlers: HashMap<TypeTag, Box<dyn ErasedHandler<E>>>,
    order: Vec<TypeTag>,
    catch_all: Option<Box<dyn ErasedHandler<E>>>,
}

impl<E: Send + 'static> HandlerRegistry<E> {
    pub fn new(executor_id: ExecutorId) -> Self {
        Self {
            executor_id,
            handlers: HashMap::new(),
            order: Vec::new(),
            catch_all: None,
        }
    }

    /// Handle messages of type `M`.
    pub fn on<M>(&mut self) -> Result<&mut Self, BuildError>
    where
        E: Handler<M>,
        M: DeserializeOwned + Send + 'static,
    {
        self.insert(TypeTag::of::<M>(), Box::new(TypedHandler::<M>(PhantomData)))
    }

    /// Handle fan-in batches whose members are all `M`.
    pub fn on_batch<M>(&mut self) -> Result<&mut Self, BuildError>
    where
        E: Handler<Vec<M>>,
        M: DeserializeOwned + Send + 'static,
    {
        self.insert(
            TypeTag::batch_of::<M>(),
            Box::new(TypedHandler::<Vec<M>>(PhantomData)),
        )
    }

    /// Handle any message without a more specific handler.
    pub fn on_any(&mut self) -> Result<&mut Self, BuildError>
    where
        E: Handler<Payload>,
    {
        if self.catch_all.is_some() {
            return Err(BuildError::DuplicateHandler {
                executor_id: self.executor_id.clone(),
                type_tag: TypeTag::of::<Payload>(),
            });
        }
        self.catch_all = Some(Box::new(CatchAllHandler));
        Ok(self)
    }

    fn insert(
        &mut self,
        type_tag: TypeTag,
        handler: Box<dyn ErasedHandler<E>>,
    ) -> Result<&mut Self, BuildError> {
        if self.handlers.contains_key(&type_tag) {
            return Err(BuildError::DuplicateHandler {
                executor_id: self.executor_id.clone(),
                type_tag,
            });
        }
        self.order.push(type_tag.clone());
        self.handlers.insert(type_tag, handler);
        Ok(self)
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    /// Registered types, in declaration order.
    pub fn types(&self) -> &[TypeTag] {
        &self.order
    }

    pub fn has_catch_all(&self) -> bool {
        self.catch_all.is_some()
    }

    pub fn accepts(&self, type_tag: &TypeTag) -> bool {
        self.handlers.contains_key(type_tag) || self.catch_all.is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.catch_all.is_none()
    }

    fn resolve(&self, type_tag: &TypeTag) -> Option<&dyn ErasedHandler<E>> {
        self.handlers
            .get(type_tag)
            .or(self.catch_all.as_ref())
            .map(|handler| handler.as_ref())
    }
}

// ============================================================================
// TYPE-ERASED NODE
// ============================================================================

/// What the scheduler needs from any node, typed executor or nested workflow.
#[async_trait]
pub(crate) trait ExecutorNode: Send + Sync {
    fn id(&self) -> &ExecutorId;

    fn description(&self) -> Option<&str>;

    /// Types handled, in declaration order.
    fn input_types(&self) -> Vec<TypeTag>;

    fn accepts(&self, type_tag: &TypeTag) -> bool;

    /// Whether a catch-all handler is registered.
    fn accepts_any(&self) -> bool {
        false
    }

    fn is_sub_workflow(&self) -> bool {
        false
    }

    async fn dispatch(
        &mut self,
        payload: Payload,
        ctx: &mut WorkflowContext,
    ) -> Result<(), ExecutorError>;

    /// Validate a caller's answer to one of this node's requests.
    fn check_response(&self, request: &PendingRequest, response: &Value) -> Result<(), String>;

    /// Drop bookkeeping tied to the previous run. Executor state is kept.
    fn clear_run_state(&mut self) {}

    async fn snapshot(&self) -> Result<Option<Value>, ExecutorError>;

    async fn restore(&mut self, state: Value) -> Result<(), ExecutorError>;
}

/// A typed executor together with its handler table.
pub(crate) struct RegisteredExecutor<E: Executor> {
    executor: E,
    handlers: HandlerRegistry<E>,
}

impl<E: Executor> RegisteredExecutor<E> {
    pub(crate) fn new(executor: E) -> Result<Self, BuildError> {
        let mut handlers = HandlerRegistry::new(executor.id().clone());
        E::register(&mut handlers)?;
        Ok(Self { executor, handlers })
    }
}

#[async_trait]
impl<E: Executor> ExecutorNode for RegisteredExecutor<E> {
    fn id(&self) -> &ExecutorId {
        self.executor.id()
    }

    fn description(&self) -> Option<&str> {
        self.executor.description()
    }

    fn input_types(&self) -> Vec<TypeTag> {
        self.handlers.types().to_vec()
    }

    fn accepts(&self, type_tag: &TypeTag) -> bool {
        self.handlers.accepts(type_tag)
    }

    fn accepts_any(&self) -> bool {
        self.handlers.has_catch_all()
    }

    async fn dispatch(
        &mut self,
        payload: Payload,
        ctx: &mut WorkflowContext,
    ) -> Result<(), ExecutorError> {
        let handler = self.handlers.resolve(&payload.type_tag).ok_or_else(|| {
            ExecutorError::new(
                self.executor.id().clone(),
                format!("No handler registered for message type '{}'", payload.type_tag),
            )
        })?;
        handler.call(&mut self.executor, payload, ctx).await
    }

    fn check_response(&self, request: &PendingRequest, response: &Value) -> Result<(), String> {
        let handler = self
            .handlers
            .resolve(&request.response_message_type)
            .ok_or_else(|| {
                format!(
                    "executor '{}' has no handler for '{}'",
                    self.executor.id(),
                    request.response_message_type
                )
            })?;
        let candidate = request.response_payload(response.clone());
        handler.check(&candidate.data)
    }

    async fn snapshot(&self) -> Result<Option<Value>, ExecutorError> {
        self.executor.on_checkpoint_save()
    }

    async fn restore(&mut self, state: Value) -> Result<(), ExecutorError> {
        self.executor.on_checkpoint_restore(state)
    }
}

// ============================================================================
// TESTS
// ============================================================================
