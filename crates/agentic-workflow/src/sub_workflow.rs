//! Sub-workflows - a whole workflow embedded as one executor.
//!
//! Every message the wrapper receives starts its own run of the inner
//! workflow, so several inputs may be suspended on forwarded requests at the
//! same time. What an inner run produces is re-surfaced in the parent:
//!
//! | Inner event | In the parent |
//! |-------------|---------------|
//! | `Output`, `Completed` | message sent from the wrapper |
//! | `Custom` | custom event of the wrapper |
//! | `RequestInfo` | offered to interceptors, otherwise forwarded |
//! | `Failed` | the wrapper's branch fails |
//!
//! A forwarded request keeps its request id, so the top-level caller answers
//! it exactly as if the inner workflow were running on its own.
//!
//! ```rust,ignore
//! let review = WorkflowExecutor::new("review", inner)
//!     .intercepts_request::<String, bool, _, _>(|question| async move {
//!         if question.contains("trivial") {
//!             Intercept::Handled(true)
//!         } else {
//!             Intercept::Forward
//!         }
//!     })?;
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use tracing::{debug, info};
use uuid::Uuid;

use crate::checkpoint::WorkflowCheckpoint;
use crate::context::WorkflowContext;
use crate::events::WorkflowEvent;
use crate::executor::ExecutorNode;
use crate::message::{Payload, RequestResponse};
use crate::request_info::{PendingRequest, Responses};
use crate::types::{BuildError, ExecutorError, ExecutorId, RequestId, TypeTag};
use crate::workflow::{EventStream, Workflow};

// ============================================================================
// INTERCEPTORS
// ============================================================================

/// Outcome of intercepting a nested request.
#[derive(Debug, Clone, PartialEq)]
pub enum Intercept<Resp> {
    /// Answer immediately; the inner workflow never suspends.
    Handled(Resp),
    /// Let the request escape to the parent's caller.
    Forward,
}

/// Answers or forwards requests of one type raised inside a sub-workflow.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    fn request_type(&self) -> TypeTag;

    fn response_type(&self) -> TypeTag;

    async fn intercept(&self, request: &PendingRequest) -> Result<Intercept<Value>, ExecutorError>;

    fn matches(&self, request: &PendingRequest) -> bool {
        request.request_type == self.request_type() && request.response_type == self.response_type()
    }
}

/// Interceptor backed by an async closure over the typed request.
struct FnInterceptor<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp, F, Fut> RequestInterceptor for FnInterceptor<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Intercept<Resp>> + Send + 'static,
{
    fn request_type(&self) -> TypeTag {
        TypeTag::of::<Req>()
    }

    fn response_type(&self) -> TypeTag {
        TypeTag::of::<Resp>()
    }

    async fn intercept(&self, request: &PendingRequest) -> Result<Intercept<Value>, ExecutorError> {
        let typed: Req = serde_json::from_value(request.data.clone())?;
        match (self.handler)(typed).await {
            Intercept::Handled(response) => Ok(Intercept::Handled(serde_json::to_value(response)?)),
            Intercept::Forward => Ok(Intercept::Forward),
        }
    }
}

// ============================================================================
// WORKFLOW EXECUTOR
// ============================================================================

/// An inner request waiting on the parent's caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForwardedRequest {
    /// Inner run that raised the request.
    execution_id: String,
    request: PendingRequest,
}

/// Snapshot of a wrapper: every suspended inner run plus what it forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubWorkflowState {
    executions: BTreeMap<String, WorkflowCheckpoint>,
    forwarded: Vec<ForwardedRequest>,
}

/// A nested workflow acting as a single executor in its parent.
///
/// Each input starts its own inner run. Only one run is loaded into the
/// nested workflow at a time; runs waiting on forwarded requests are parked
/// as checkpoints and loaded again when one of their answers arrives.
pub struct WorkflowExecutor {
    id: ExecutorId,
    workflow: Workflow,
    interceptors: Vec<Box<dyn RequestInterceptor>>,
    forwarded: BTreeMap<RequestId, ForwardedRequest>,
    parked: BTreeMap<String, WorkflowCheckpoint>,
    /// Run currently loaded into `workflow`.
    active: Option<String>,
    description: Option<String>,
}

impl WorkflowExecutor {
    pub fn new(id: impl Into<ExecutorId>, workflow: Workflow) -> Self {
        Self {
            id: id.into(),
            workflow,
            interceptors: Vec::new(),
            forwarded: BTreeMap::new(),
            parked: BTreeMap::new(),
            active: None,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Register an interceptor for inner requests of type `Req` expecting `Resp`.
    ///
    /// # Errors
    ///
    /// `DuplicateHandler` if that request type is already intercepted.
    pub fn intercepts_request<Req, Resp, F, Fut>(self, handler: F) -> Result<Self, BuildError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Intercept<Resp>> + Send + 'static,
    {
        self.with_interceptor(Box::new(FnInterceptor::<Req, Resp, F> {
            handler,
            _types: PhantomData,
        }))
    }

    /// Register a hand-written interceptor.
    pub fn with_interceptor(mut self, interceptor: Box<dyn RequestInterceptor>) -> Result<Self, BuildError> {
        let request_type = interceptor.request_type();
        if self
            .interceptors
            .iter()
            .any(|existing| existing.request_type() == request_type)
        {
            return Err(BuildError::DuplicateHandler {
                executor_id: self.id.clone(),
                type_tag: request_type,
            });
        }
        self.interceptors.push(interceptor);
        Ok(self)
    }

    pub fn id(&self) -> &ExecutorId {
        &self.id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Requests currently forwarded to the parent.
    pub fn forwarded_requests(&self) -> Vec<&PendingRequest> {
        self.forwarded.values().map(|f| &f.request).collect()
    }

    /// Number of inner runs waiting on forwarded requests.
    pub fn suspended_runs(&self) -> usize {
        let mut runs: Vec<&str> = self
            .forwarded
            .values()
            .map(|f| f.execution_id.as_str())
            .collect();
        runs.sort_unstable();
        runs.dedup();
        runs.len()
    }

    /// Tag of the message a forwarded request's answer arrives as.
    fn forwarded_response_tag() -> TypeTag {
        TypeTag::of::<RequestResponse<Value, Value>>()
    }

    fn is_waiting(&self, execution_id: &str) -> bool {
        self.forwarded.values().any(|f| f.execution_id == execution_id)
    }

    /// Park the loaded run if it still waits on the parent.
    async fn park_active(&mut self) -> Result<(), ExecutorError> {
        let Some(execution_id) = self.active.take() else {
            return Ok(());
        };
        if self.is_waiting(&execution_id) {
            let checkpoint = self
                .workflow
                .capture_checkpoint()
                .await
                .map_err(|err| inner_error(&self.id, err))?;
            debug!(executor_id = %self.id, execution_id = %execution_id, "Sub-workflow run parked");
            self.parked.insert(execution_id, checkpoint);
        }
        Ok(())
    }

    /// Load a parked run into the nested workflow.
    async fn activate(&mut self, execution_id: &str) -> Result<(), ExecutorError> {
        if self.active.as_deref() == Some(execution_id) {
            return Ok(());
        }
        self.park_active().await?;
        let checkpoint = self.parked.remove(execution_id).ok_or_else(|| {
            inner_error(&self.id, format!("no suspended run '{execution_id}'"))
        })?;
        if let Err(err) = self.workflow.restore_checkpoint(&checkpoint).await {
            self.parked.insert(execution_id.to_string(), checkpoint);
            return Err(inner_error(&self.id, err));
        }
        self.active = Some(execution_id.to_string());
        Ok(())
    }

    /// Publish an inner request under the wrapper's name, keeping its id.
    fn forward(
        &mut self,
        execution_id: &str,
        request: PendingRequest,
        ctx: &mut WorkflowContext,
        raised: &mut Vec<RequestId>,
    ) {
        info!(
            executor_id = %self.id,
            execution_id = %execution_id,
            request_id = %request.request_id,
            request_type = %request.request_type,
            "Forwarding sub-workflow request"
        );
        ctx.raise_request(PendingRequest {
            request_id: request.request_id.clone(),
            source_executor_id: self.id.clone(),
            request_type: request.request_type.clone(),
            response_type: request.response_type.clone(),
            response_message_type: Self::forwarded_response_tag(),
            data: request.data.clone(),
            created_at: request.created_at,
        });
        raised.push(request.request_id.clone());
        self.forwarded.insert(
            request.request_id.clone(),
            ForwardedRequest {
                execution_id: execution_id.to_string(),
                request,
            },
        );
    }

    /// Re-surface one batch of inner events; returns the requests it raised.
    fn surface(
        &self,
        events: Vec<WorkflowEvent>,
        ctx: &mut WorkflowContext,
    ) -> Result<Vec<PendingRequest>, ExecutorError> {
        let mut requests = Vec::new();
        for event in events {
            match event {
                WorkflowEvent::Output { payload, .. } | WorkflowEvent::Completed { payload, .. } => {
                    ctx.send_payload(payload, None);
                }
                WorkflowEvent::Custom { event_type, data, .. } => ctx.add_event(&event_type, data),
                WorkflowEvent::RequestInfo { request } => requests.push(request),
                WorkflowEvent::Terminated { reason } => {
                    ctx.add_event("sub_workflow_terminated", serde_json::to_value(&reason)?);
                }
                WorkflowEvent::Failed { error } => return Err(inner_error(&self.id, error)),
                _ => {}
            }
        }
        Ok(requests)
    }

    /// Drain inner events, answering intercepted requests until the inner run
    /// either finishes or waits on forwarded ones.
    async fn absorb(
        &mut self,
        execution_id: &str,
        mut events: Vec<WorkflowEvent>,
        ctx: &mut WorkflowContext,
        raised: &mut Vec<RequestId>,
    ) -> Result<(), ExecutorError> {
        loop {
            let requests = self.surface(events, ctx)?;

            let mut responses = Responses::new();
            for request in requests {
                let verdict = match self.interceptors.iter().find(|i| i.matches(&request)) {
                    Some(interceptor) => interceptor.intercept(&request).await?,
                    None => Intercept::Forward,
                };
                match verdict {
                    Intercept::Handled(value) => {
                        debug!(
                            executor_id = %self.id,
                            request_id = %request.request_id,
                            "Sub-workflow request handled locally"
                        );
                        responses.insert(request.request_id, value);
                    }
                    Intercept::Forward => self.forward(execution_id, request, ctx, raised),
                }
            }

            if responses.is_empty() {
                return Ok(());
            }
            let id = self.id.clone();
            events = match self.workflow.send_responses_streaming(responses).await {
                Ok(stream) => collect(stream).await,
                Err(err) => return Err(inner_error(&id, err)),
            };
        }
    }

    async fn deliver(
        &mut self,
        payload: Payload,
        ctx: &mut WorkflowContext,
        raised: &mut Vec<RequestId>,
    ) -> Result<(), ExecutorError> {
        let id = self.id.clone();

        if payload.type_tag == Self::forwarded_response_tag() {
            let response: RequestResponse<Value, Value> = serde_json::from_value(payload.data)?;
            let execution_id = match self.forwarded.get(&response.request_id) {
                Some(forwarded) => forwarded.execution_id.clone(),
                None => {
                    return Err(inner_error(
                        &id,
                        format!("no forwarded request '{}'", response.request_id),
                    ));
                }
            };
            self.activate(&execution_id).await?;
            self.forwarded.remove(&response.request_id);

            let mut responses = Responses::new();
            responses.insert(response.request_id, response.data);
            let events = match self.workflow.send_responses_streaming(responses).await {
                Ok(stream) => collect(stream).await,
                Err(err) => return Err(inner_error(&id, err)),
            };
            return self.absorb(&execution_id, events, ctx, raised).await;
        }

        self.park_active().await?;
        let execution_id = format!("exec-{}", Uuid::new_v4());
        debug!(executor_id = %id, execution_id = %execution_id, "Sub-workflow run started");
        self.active = Some(execution_id.clone());
        let events = match self.workflow.start_stream(payload).await {
            Ok(stream) => collect(stream).await,
            Err(err) => return Err(inner_error(&id, err)),
        };
        self.absorb(&execution_id, events, ctx, raised).await
    }
}

fn inner_error(id: &ExecutorId, err: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::new(id.clone(), format!("Sub-workflow error: {err}"))
}

async fn collect(stream: EventStream<'_>) -> Vec<WorkflowEvent> {
    stream.collect().await
}

#[async_trait]
impl ExecutorNode for WorkflowExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn input_types(&self) -> Vec<TypeTag> {
        let mut types = self.workflow.start_input_types();
        types.push(Self::forwarded_response_tag());
        types
    }

    fn accepts(&self, type_tag: &TypeTag) -> bool {
        *type_tag == Self::forwarded_response_tag() || self.workflow.start_accepts(type_tag)
    }

    fn is_sub_workflow(&self) -> bool {
        true
    }

    async fn dispatch(&mut self, payload: Payload, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        // Requests raised by a failing delivery are rolled back with its effects.
        let mut raised = Vec::new();
        let result = self.deliver(payload, ctx, &mut raised).await;
        if result.is_err() {
            for request_id in raised {
                self.forwarded.remove(&request_id);
            }
        }
        result
    }

    fn check_response(&self, request: &PendingRequest, response: &Value) -> Result<(), String> {
        let forwarded = self.forwarded.get(&request.request_id).ok_or_else(|| {
            format!(
                "request '{}' is not waiting in sub-workflow '{}'",
                request.request_id, self.id
            )
        })?;
        if self.active.as_deref() == Some(forwarded.execution_id.as_str()) {
            return self
                .workflow
                .check_response(&request.request_id, response)
                .map_err(|err| err.to_string());
        }
        match self.parked.get(&forwarded.execution_id) {
            Some(checkpoint) => self
                .workflow
                .check_parked_response(checkpoint, &request.request_id, response),
            None => Err(format!(
                "sub-workflow run '{}' of '{}' is gone",
                forwarded.execution_id, self.id
            )),
        }
    }

    fn clear_run_state(&mut self) {
        self.forwarded.clear();
        self.parked.clear();
        self.active = None;
    }

    async fn snapshot(&self) -> Result<Option<Value>, ExecutorError> {
        let mut executions = self.parked.clone();
        if let Some(active) = &self.active {
            if self.is_waiting(active) {
                let checkpoint = self
                    .workflow
                    .capture_checkpoint()
                    .await
                    .map_err(|err| inner_error(&self.id, err))?;
                executions.insert(active.clone(), checkpoint);
            }
        }
        let state = SubWorkflowState {
            executions,
            forwarded: self.forwarded.values().cloned().collect(),
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    async fn restore(&mut self, state: Value) -> Result<(), ExecutorError> {
        let state: SubWorkflowState = serde_json::from_value(state)?;
        self.parked = state.executions;
        self.forwarded = state
            .forwarded
            .into_iter()
            .map(|f| (f.request.request_id.clone(), f))
            .collect();
        self.active = None;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
