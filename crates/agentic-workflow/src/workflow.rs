//! Workflow - Runs executors using the Superstep model.
//!
//! A workflow runs executors in discrete supersteps (BSP/Pregel model):
//! 1. Every executor with queued messages runs, concurrently with the others
//! 2. Messages, outputs, events and requests they emit are collected
//! 3. Messages are routed through edges into the next superstep's inbox
//! 4. Repeat until no messages remain, an executor completes the run, or a
//!    bound is hit
//!
//! Supersteps are a barrier: superstep `n + 1` never starts before every
//! executor of superstep `n` has returned.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut workflow = WorkflowBuilder::new("text")
//!     .add_executor(Upper::new("upper"))
//!     .add_executor(Reverse::new("reverse"))
//!     .set_start_executor("upper")
//!     .add_edge("upper", "reverse")
//!     .build()?;
//!
//! let mut stream = workflow.run_stream(&"hello world".to_string()).await?;
//! while let Some(event) = stream.next().await {
//!     println!("{}", event.kind());
//! }
//! ```

use async_stream::stream;
use chrono::Utc;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::builder::{NodeSlot, WorkflowGraph};
use crate::checkpoint::{CheckpointStorage, WorkflowCheckpoint, CHECKPOINT_SCHEMA_VERSION};
use crate::context::{ContextEffects, SharedStateBackend, WorkflowContext};
use crate::events::{RunState, TerminationReason, WorkflowEvent};
use crate::executor::ExecutorNode;
use crate::message::{Message, Payload};
use crate::request_info::{PendingRequest, PendingRequestTable, Responses};
use crate::router::{Inbox, Router};
use crate::types::{
    CheckpointError, CheckpointId, CorrelationError, ExecutorError, ExecutorId, RequestId,
    TypeTag, WorkflowError, WorkflowId, WorkflowResult,
};

/// Source id of messages injected by the caller.
pub const INPUT_SOURCE: &str = "__input__";

/// Stream of events for one run segment.
///
/// The run only advances while the stream is polled. Dropping it between
/// events leaves undelivered messages queued and the state `Running`; the
/// workflow can then be checkpointed or started afresh. A superstep whose
/// executors were already running when the stream was dropped is lost.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = WorkflowEvent> + Send + 'a>>;

// ============================================================================
// WORKFLOW CONFIGURATION
// ============================================================================

/// What happens to the run when an executor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the run failed once the superstep finishes.
    #[default]
    FailRun,
    /// Surface the failure as an event and keep going.
    Continue,
}

/// Configuration for workflow execution.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Maximum number of supersteps before termination.
    pub max_supersteps: u32,
    /// Consecutive supersteps without output before termination.
    pub max_stall_supersteps: Option<u32>,
    /// Enable checkpointing at superstep boundaries.
    pub enable_checkpointing: bool,
    /// Checkpoint every N supersteps (if enabled).
    pub checkpoint_interval: u32,
    /// Timeout per handler invocation in milliseconds.
    pub executor_timeout_ms: Option<u64>,
    pub failure_policy: FailurePolicy,
    /// End the run after the first superstep that yields an output.
    pub terminate_on_output: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_supersteps: 100,
            max_stall_supersteps: None,
            enable_checkpointing: false,
            checkpoint_interval: 1,
            executor_timeout_ms: None,
            failure_policy: FailurePolicy::FailRun,
            terminate_on_output: false,
        }
    }
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_supersteps(mut self, max: u32) -> Self {
        self.max_supersteps = max;
        self
    }

    pub fn with_max_stall_supersteps(mut self, max: u32) -> Self {
        self.max_stall_supersteps = Some(max);
        self
    }

    pub fn with_checkpointing(mut self, enabled: bool) -> Self {
        self.enable_checkpointing = enabled;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn with_executor_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.executor_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_terminate_on_output(mut self, enabled: bool) -> Self {
        self.terminate_on_output = enabled;
        self
    }
}

// ============================================================================
// RUN RESULT
// ============================================================================

/// A run segment collected into memory.
#[derive(Debug, Clone)]
pub struct WorkflowRunResult {
    pub events: Vec<WorkflowEvent>,
    /// Scheduler state when the segment ended.
    pub state: RunState,
    /// Requests still waiting for a response.
    pub pending_requests: Vec<PendingRequest>,
}

impl WorkflowRunResult {
    pub fn outputs(&self) -> Vec<&Payload> {
        self.events
            .iter()
            .filter_map(|event| match event {
                WorkflowEvent::Output { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Outputs of type `T`, in emission order. Other types are skipped.
    pub fn outputs_as<T: DeserializeOwned>(&self) -> Vec<T> {
        self.events.iter().filter_map(WorkflowEvent::output_as).collect()
    }

    pub fn completion(&self) -> Option<&Payload> {
        self.events.iter().find_map(|event| match event {
            WorkflowEvent::Completed { payload, .. } => Some(payload),
            _ => None,
        })
    }

    pub fn completion_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.events.iter().find_map(WorkflowEvent::completion_as)
    }

    /// Requests surfaced during this segment.
    pub fn request_info_events(&self) -> Vec<&PendingRequest> {
        self.events
            .iter()
            .filter_map(|event| match event {
                WorkflowEvent::RequestInfo { request } => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.events.iter().find_map(|event| match event {
            WorkflowEvent::Terminated { reason } => Some(reason),
            _ => None,
        })
    }

    pub fn routing_warnings(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                WorkflowEvent::RoutingWarning { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.state == RunState::AwaitingInput
    }

    pub fn is_failed(&self) -> bool {
        self.state == RunState::Failed
    }

    /// Run-level failure message, if the run failed.
    pub fn error(&self) -> Option<&str> {
        self.events.iter().find_map(|event| match event {
            WorkflowEvent::Failed { error } => Some(error.as_str()),
            _ => None,
        })
    }
}

// ============================================================================
// WORKFLOW
// ============================================================================

#[derive(Debug, Default)]
struct RunnerState {
    state: RunState,
    iteration: u32,
    stall_count: u32,
    inbox: Inbox,
    pending_requests: PendingRequestTable,
    router: Router,
}

/// What one superstep produced.
#[derive(Default)]
struct SuperstepReport {
    events: Vec<WorkflowEvent>,
    failures: Vec<String>,
    produced_output: bool,
    completion: Option<(ExecutorId, Payload)>,
}

struct ExecutorOutcome {
    executor_id: ExecutorId,
    effects: ContextEffects,
    error: Option<ExecutorError>,
}

/// A built, runnable workflow.
pub struct Workflow {
    graph: WorkflowGraph,
    nodes: BTreeMap<ExecutorId, NodeSlot>,
    config: WorkflowConfig,
    state_backend: Arc<dyn SharedStateBackend>,
    checkpoint_storage: Option<Arc<dyn CheckpointStorage>>,
    runtime: RunnerState,
}

impl Workflow {
    pub(crate) fn from_parts(
        graph: WorkflowGraph,
        nodes: BTreeMap<ExecutorId, NodeSlot>,
        config: WorkflowConfig,
        state_backend: Arc<dyn SharedStateBackend>,
        checkpoint_storage: Option<Arc<dyn CheckpointStorage>>,
    ) -> Self {
        Self {
            graph,
            nodes,
            config,
            state_backend,
            checkpoint_storage,
            runtime: RunnerState::default(),
        }
    }

    pub fn id(&self) -> &WorkflowId {
        &self.graph.id
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.checkpoint_storage = Some(storage);
        self
    }

    pub fn with_state_backend(mut self, backend: Arc<dyn SharedStateBackend>) -> Self {
        self.state_backend = backend;
        self
    }

    pub fn checkpoint_storage(&self) -> Option<&Arc<dyn CheckpointStorage>> {
        self.checkpoint_storage.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.runtime.state
    }

    /// Supersteps completed so far in this run.
    pub fn iteration(&self) -> u32 {
        self.runtime.iteration
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.runtime.pending_requests.to_vec()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.runtime.pending_requests.is_empty()
    }

    /// DOT rendering of the graph.
    pub fn to_dot(&self) -> String {
        crate::viz::WorkflowViz::new(&self.graph).to_dot()
    }

    pub(crate) fn start_accepts(&self, type_tag: &TypeTag) -> bool {
        self.nodes
            .get(&self.graph.start)
            .map_or(false, |slot| slot.node.accepts(type_tag))
    }

    pub(crate) fn start_input_types(&self) -> Vec<TypeTag> {
        self.nodes
            .get(&self.graph.start)
            .map(|slot| slot.node.input_types())
            .unwrap_or_default()
    }

    // ========================================================================
    // RUN SURFACES
    // ========================================================================

    /// Start a fresh run and stream its events.
    ///
    /// # Errors
    ///
    /// `UnsupportedInput` if the start executor has no handler for `T`.
    pub async fn run_stream<T: Serialize>(&mut self, input: &T) -> WorkflowResult<EventStream<'_>> {
        let payload = Payload::new(input)?;
        self.start_stream(payload).await
    }

    pub(crate) async fn start_stream(&mut self, payload: Payload) -> WorkflowResult<EventStream<'_>> {
        if !self.start_accepts(&payload.type_tag) {
            return Err(WorkflowError::UnsupportedInput {
                executor_id: self.graph.start.clone(),
                type_tag: payload.type_tag,
            });
        }

        self.reset().await?;
        let start = self.graph.start.clone();
        self.runtime
            .inbox
            .entry(start)
            .or_default()
            .push(Message::new(payload, ExecutorId::new(INPUT_SOURCE), None));

        Ok(self.drive(true, Vec::new()))
    }

    /// Answer pending requests and continue the run.
    ///
    /// Every response is validated before anything changes: an unknown id or
    /// a payload that does not decode as the requested type rejects the whole
    /// batch and leaves the pending table untouched.
    pub async fn send_responses_streaming(
        &mut self,
        responses: Responses,
    ) -> WorkflowResult<EventStream<'_>> {
        if responses.is_empty() {
            return Err(CorrelationError::EmptyResponses.into());
        }

        let mut ordered: Vec<(RequestId, serde_json::Value)> = responses.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        for (request_id, value) in &ordered {
            self.check_response(request_id, value)?;
        }

        for (request_id, value) in ordered {
            let request = self.runtime.pending_requests.resolve(&request_id)?;
            info!(
                workflow_id = %self.graph.id,
                request_id = %request_id,
                executor_id = %request.source_executor_id,
                "Response accepted"
            );
            let source = request.source_executor_id.clone();
            self.runtime
                .inbox
                .entry(source.clone())
                .or_default()
                .push(Message::new(
                    request.response_payload(value),
                    ExecutorId::new(INPUT_SOURCE),
                    Some(source),
                ));
        }

        Ok(self.drive(false, Vec::new()))
    }

    /// Validate one response against the pending table.
    pub(crate) fn check_response(
        &self,
        request_id: &RequestId,
        value: &serde_json::Value,
    ) -> Result<(), CorrelationError> {
        let request = self
            .runtime
            .pending_requests
            .get(request_id)
            .ok_or_else(|| CorrelationError::UnknownRequest(request_id.clone()))?;
        let reason = match self.nodes.get(&request.source_executor_id) {
            Some(slot) => slot.node.check_response(request, value).err(),
            None => Some(format!(
                "requesting executor '{}' is not part of this workflow",
                request.source_executor_id
            )),
        };
        match reason {
            None => Ok(()),
            Some(reason) => Err(CorrelationError::TypeMismatch {
                request_id: request_id.clone(),
                expected: request.response_type.clone(),
                reason,
            }),
        }
    }

    /// Validate a response to a request captured in `checkpoint` without
    /// loading it.
    pub(crate) fn check_parked_response(
        &self,
        checkpoint: &WorkflowCheckpoint,
        request_id: &RequestId,
        value: &serde_json::Value,
    ) -> Result<(), String> {
        let request = checkpoint
            .pending_requests
            .iter()
            .find(|request| &request.request_id == request_id)
            .ok_or_else(|| format!("request '{request_id}' is not pending in '{}'", self.graph.id))?;
        let slot = self.nodes.get(&request.source_executor_id).ok_or_else(|| {
            format!(
                "requesting executor '{}' is not part of this workflow",
                request.source_executor_id
            )
        })?;
        // A nested wrapper's bookkeeping is only loaded on delivery.
        if slot.node.is_sub_workflow() {
            return Ok(());
        }
        slot.node.check_response(request, value)
    }

    /// Restore a stored checkpoint and continue from it.
    ///
    /// Pending requests captured in the checkpoint are surfaced again as
    /// `RequestInfo` events.
    pub async fn run_stream_from_checkpoint(
        &mut self,
        checkpoint_id: &CheckpointId,
    ) -> WorkflowResult<EventStream<'_>> {
        let storage = self
            .checkpoint_storage
            .clone()
            .ok_or(CheckpointError::StorageNotConfigured)?;
        let checkpoint = storage.load(checkpoint_id).await?;
        self.restore_checkpoint(&checkpoint).await?;

        let resurface = self.runtime.pending_requests.to_vec();
        Ok(self.drive(true, resurface))
    }

    /// Collect a fresh run.
    pub async fn run<T: Serialize>(&mut self, input: &T) -> WorkflowResult<WorkflowRunResult> {
        let events: Vec<WorkflowEvent> = self.run_stream(input).await?.collect().await;
        Ok(self.collect_result(events))
    }

    /// Collect the continuation after answering requests.
    pub async fn send_responses(&mut self, responses: Responses) -> WorkflowResult<WorkflowRunResult> {
        let events: Vec<WorkflowEvent> = self.send_responses_streaming(responses).await?.collect().await;
        Ok(self.collect_result(events))
    }

    /// Collect a run resumed from a checkpoint.
    pub async fn run_from_checkpoint(
        &mut self,
        checkpoint_id: &CheckpointId,
    ) -> WorkflowResult<WorkflowRunResult> {
        let events: Vec<WorkflowEvent> = self
            .run_stream_from_checkpoint(checkpoint_id)
            .await?
            .collect()
            .await;
        Ok(self.collect_result(events))
    }

    fn collect_result(&self, events: Vec<WorkflowEvent>) -> WorkflowRunResult {
        WorkflowRunResult {
            events,
            state: self.runtime.state,
            pending_requests: self.runtime.pending_requests.to_vec(),
        }
    }

    // ========================================================================
    // CHECKPOINTS
    // ========================================================================

    /// Snapshot the run at the current superstep boundary.
    pub async fn capture_checkpoint(&self) -> WorkflowResult<WorkflowCheckpoint> {
        let mut executor_states = BTreeMap::new();
        for (id, slot) in &self.nodes {
            if let Some(state) = slot.node.snapshot().await? {
                executor_states.insert(id.clone(), state);
            }
        }

        Ok(WorkflowCheckpoint {
            checkpoint_id: CheckpointId::generate(),
            workflow_id: self.graph.id.clone(),
            iteration_count: self.runtime.iteration,
            timestamp: Utc::now(),
            executor_states,
            messages: self.runtime.inbox.clone(),
            pending_requests: self.runtime.pending_requests.to_vec(),
            shared_state: self.state_backend.snapshot().await?,
            fan_in_buffers: self.runtime.router.buffers().clone(),
            stall_count: self.runtime.stall_count,
            graph_signature: self.graph.signature(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
        })
    }

    /// Rebuild scheduler and executor state from `checkpoint`.
    ///
    /// The checkpoint itself is never modified. On error the workflow must be
    /// restored again or restarted before it is run.
    pub async fn restore_checkpoint(&mut self, checkpoint: &WorkflowCheckpoint) -> WorkflowResult<()> {
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::SchemaMismatch {
                expected: CHECKPOINT_SCHEMA_VERSION,
                found: checkpoint.schema_version,
            }
            .into());
        }

        let expected = self.graph.signature();
        if checkpoint.graph_signature != expected {
            return Err(CheckpointError::GraphMismatch {
                expected,
                found: checkpoint.graph_signature.clone(),
            }
            .into());
        }

        let referenced = checkpoint
            .executor_states
            .keys()
            .chain(checkpoint.messages.keys())
            .chain(
                checkpoint
                    .pending_requests
                    .iter()
                    .map(|r| &r.source_executor_id),
            );
        for id in referenced {
            if !self.nodes.contains_key(id) {
                return Err(CheckpointError::UnknownExecutor(id.clone()).into());
            }
        }
        let pending_requests =
            PendingRequestTable::from_requests(checkpoint.pending_requests.iter().cloned())?;

        for slot in self.nodes.values_mut() {
            slot.reset()?;
        }
        for (id, state) in &checkpoint.executor_states {
            if let Some(slot) = self.nodes.get_mut(id) {
                slot.node.restore(state.clone()).await.map_err(|err| {
                    CheckpointError::RestoreFailed {
                        executor_id: id.clone(),
                        reason: err.message,
                    }
                })?;
            }
        }
        self.state_backend
            .replace(checkpoint.shared_state.clone())
            .await?;

        self.runtime = RunnerState {
            state: RunState::Idle,
            iteration: checkpoint.iteration_count,
            stall_count: checkpoint.stall_count,
            inbox: checkpoint.messages.clone(),
            pending_requests,
            router: Router::with_buffers(checkpoint.fan_in_buffers.clone()),
        };

        info!(
            workflow_id = %self.graph.id,
            checkpoint_id = %checkpoint.checkpoint_id,
            iteration = checkpoint.iteration_count,
            "Checkpoint restored"
        );
        Ok(())
    }

    async fn write_checkpoint(&self) -> WorkflowResult<CheckpointId> {
        let storage = self
            .checkpoint_storage
            .as_ref()
            .ok_or(CheckpointError::StorageNotConfigured)?;
        let checkpoint = self.capture_checkpoint().await?;
        let id = storage.save(&checkpoint).await?;
        debug!(
            workflow_id = %self.graph.id,
            checkpoint_id = %id,
            iteration = checkpoint.iteration_count,
            "Checkpoint created"
        );
        Ok(id)
    }

    // ========================================================================
    // SUPERSTEP LOOP
    // ========================================================================

    async fn reset(&mut self) -> WorkflowResult<()> {
        for slot in self.nodes.values_mut() {
            slot.reset()?;
        }
        self.state_backend.replace(HashMap::new()).await?;
        self.runtime = RunnerState::default();
        Ok(())
    }

    fn drive(&mut self, announce: bool, resurface: Vec<PendingRequest>) -> EventStream<'_> {
        let this = self;
        Box::pin(stream! {
            let workflow_id = this.graph.id.clone();
            this.runtime.state = RunState::Running;

            if announce {
                info!(workflow_id = %workflow_id, iteration = this.runtime.iteration, "Workflow run started");
                yield WorkflowEvent::Started {
                    workflow_id: workflow_id.clone(),
                    timestamp: Utc::now(),
                };
            }
            yield WorkflowEvent::Status { state: RunState::Running };
            for request in resurface {
                yield WorkflowEvent::RequestInfo { request };
            }

            loop {
                if this.runtime.inbox.is_empty() {
                    let state = if this.runtime.pending_requests.is_empty() {
                        RunState::Completed
                    } else {
                        RunState::AwaitingInput
                    };
                    this.runtime.state = state;
                    info!(
                        workflow_id = %workflow_id,
                        state = %state,
                        supersteps = this.runtime.iteration,
                        pending_requests = this.runtime.pending_requests.len(),
                        "No messages left"
                    );
                    // A suspended run may still fill its joins after responses.
                    if state == RunState::Completed {
                        for event in this.runtime.router.stranded() {
                            yield event;
                        }
                    }
                    yield WorkflowEvent::Status { state };
                    break;
                }

                if this.runtime.iteration >= this.config.max_supersteps {
                    let limit = this.config.max_supersteps;
                    this.runtime.state = RunState::Idle;
                    warn!(workflow_id = %workflow_id, limit, "Superstep limit reached");
                    yield WorkflowEvent::Terminated {
                        reason: TerminationReason::MaxSupersteps { limit },
                    };
                    yield WorkflowEvent::Status { state: RunState::Idle };
                    break;
                }

                let iteration = this.runtime.iteration;
                let invoked: Vec<ExecutorId> = this.runtime.inbox.keys().cloned().collect();
                debug!(workflow_id = %workflow_id, superstep = iteration, active = invoked.len(), "Superstep started");
                yield WorkflowEvent::SuperstepStarted { iteration };
                for executor_id in invoked {
                    yield WorkflowEvent::ExecutorInvoked { executor_id };
                }

                // Messages stay queued until the superstep actually runs.
                let inbox = std::mem::take(&mut this.runtime.inbox);
                let report = this.execute_superstep(inbox).await;
                let SuperstepReport { events, failures, produced_output, completion } = report;
                for event in events {
                    yield event;
                }

                if !failures.is_empty() && this.config.failure_policy == FailurePolicy::FailRun {
                    this.runtime.state = RunState::Failed;
                    let error = failures.join("; ");
                    warn!(workflow_id = %workflow_id, superstep = iteration, error = %error, "Workflow failed");
                    yield WorkflowEvent::Failed { error };
                    yield WorkflowEvent::Status { state: RunState::Failed };
                    break;
                }

                let interval = this.config.checkpoint_interval.max(1);
                if this.config.enable_checkpointing && this.runtime.iteration % interval == 0 {
                    match this.write_checkpoint().await {
                        Ok(checkpoint_id) => {
                            yield WorkflowEvent::CheckpointCreated {
                                checkpoint_id,
                                iteration: this.runtime.iteration,
                            };
                        }
                        Err(err) => {
                            this.runtime.state = RunState::Failed;
                            warn!(workflow_id = %workflow_id, error = %err, "Checkpoint failed");
                            yield WorkflowEvent::Failed { error: err.to_string() };
                            yield WorkflowEvent::Status { state: RunState::Failed };
                            break;
                        }
                    }
                }

                if let Some((executor_id, payload)) = completion {
                    this.runtime.state = RunState::Completed;
                    info!(workflow_id = %workflow_id, executor_id = %executor_id, "Workflow completed");
                    for event in this.runtime.router.stranded() {
                        yield event;
                    }
                    yield WorkflowEvent::Completed { executor_id, payload };
                    yield WorkflowEvent::Status { state: RunState::Completed };
                    break;
                }
                if produced_output && this.config.terminate_on_output {
                    this.runtime.state = RunState::Completed;
                    info!(workflow_id = %workflow_id, "Workflow completed on output");
                    yield WorkflowEvent::Status { state: RunState::Completed };
                    break;
                }

                if produced_output {
                    this.runtime.stall_count = 0;
                } else {
                    this.runtime.stall_count += 1;
                }
                if let Some(max) = this.config.max_stall_supersteps {
                    if this.runtime.stall_count >= max {
                        let supersteps = this.runtime.stall_count;
                        this.runtime.state = RunState::Idle;
                        warn!(workflow_id = %workflow_id, supersteps, "Workflow stalled");
                        yield WorkflowEvent::Terminated {
                            reason: TerminationReason::Stalled { supersteps },
                        };
                        yield WorkflowEvent::Status { state: RunState::Idle };
                        break;
                    }
                }
            }
        })
    }

    /// Run every executor with queued messages, then commit their effects.
    async fn execute_superstep(&mut self, mut inbox: Inbox) -> SuperstepReport {
        let iteration = self.runtime.iteration;
        let workflow_id = self.graph.id.clone();
        let backend = self.state_backend.clone();
        let timeout_ms = self.config.executor_timeout_ms;

        let runs: Vec<_> = self
            .nodes
            .iter_mut()
            .filter_map(|(id, slot)| {
                let messages = inbox.remove(id)?;
                let ctx = WorkflowContext::new(workflow_id.clone(), id.clone(), iteration, backend.clone());
                Some(run_executor(slot.node.as_mut(), messages, ctx, timeout_ms))
            })
            .collect();
        let outcomes = join_all(runs).await;

        for (id, messages) in inbox {
            warn!(executor_id = %id, dropped = messages.len(), "Messages for unknown executor dropped");
        }

        let mut report = SuperstepReport::default();
        for outcome in outcomes {
            self.commit(outcome, &mut report);
        }
        report
            .events
            .push(WorkflowEvent::SuperstepCompleted { iteration });
        self.runtime.iteration += 1;
        debug!(workflow_id = %workflow_id, superstep = iteration, queued = self.runtime.inbox.len(), "Superstep completed");
        report
    }

    fn commit(&mut self, outcome: ExecutorOutcome, report: &mut SuperstepReport) {
        let ExecutorOutcome {
            executor_id,
            mut effects,
            mut error,
        } = outcome;

        if error.is_none() {
            let unanswerable = effects.requests.iter().find(|request| {
                !self
                    .nodes
                    .get(&request.source_executor_id)
                    .map_or(false, |slot| slot.node.accepts(&request.response_message_type))
            });
            if let Some(request) = unanswerable {
                error = Some(ExecutorError::new(
                    executor_id.clone(),
                    format!(
                        "No handler for response type '{}' of request '{}'",
                        request.response_message_type, request.request_id
                    ),
                ));
                effects = ContextEffects::default();
            }
        }

        report.events.append(&mut effects.events);
        for payload in effects.outputs {
            report.produced_output = true;
            report.events.push(WorkflowEvent::Output {
                executor_id: executor_id.clone(),
                payload,
            });
        }
        for request in effects.requests {
            match self.runtime.pending_requests.insert(request.clone()) {
                Ok(()) => {
                    info!(
                        executor_id = %executor_id,
                        request_id = %request.request_id,
                        request_type = %request.request_type,
                        "Request for information raised"
                    );
                    report.events.push(WorkflowEvent::RequestInfo { request });
                }
                Err(err) => {
                    error.get_or_insert_with(|| ExecutorError::new(executor_id.clone(), err.to_string()));
                }
            }
        }
        if let Some(payload) = effects.completion {
            report.produced_output = true;
            if report.completion.is_none() {
                report.completion = Some((executor_id.clone(), payload));
            }
        }
        for message in effects.messages {
            let warnings = self
                .runtime
                .router
                .route(&self.graph, message, &mut self.runtime.inbox);
            report.events.extend(warnings);
        }

        match error {
            None => report.events.push(WorkflowEvent::ExecutorCompleted { executor_id }),
            Some(err) => {
                warn!(executor_id = %executor_id, error = %err, "Executor failed");
                let error = err.to_string();
                report.failures.push(error.clone());
                report
                    .events
                    .push(WorkflowEvent::ExecutorFailed { executor_id, error });
            }
        }
    }
}

/// Deliver an executor's messages one at a time. The first failure ends the
/// branch; effects of the failing handler are discarded.
async fn run_executor(
    node: &mut dyn ExecutorNode,
    messages: Vec<Message>,
    mut ctx: WorkflowContext,
    timeout_ms: Option<u64>,
) -> ExecutorOutcome {
    let executor_id = node.id().clone();
    let mut error = None;

    for (index, message) in messages.into_iter().enumerate() {
        let mark = ctx.mark();
        let result = match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), node.dispatch(message.payload, &mut ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutorError::timeout(executor_id.clone(), ms)),
                }
            }
            None => node.dispatch(message.payload, &mut ctx).await,
        };
        if let Err(err) = result {
            ctx.rollback(mark);
            debug!(executor_id = %executor_id, message_index = index, "Handler failed, remaining messages skipped");
            error = Some(err);
            break;
        }
    }

    ExecutorOutcome {
        executor_id,
        effects: ctx.into_effects(),
        error,
    }
}

// ============================================================================
// TESTS
// ============================================================================
