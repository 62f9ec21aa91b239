//! Orchestration patterns built on [`WorkflowBuilder`].
//!
//! ```text
//! Sequential:  A ──▶ B ──▶ C
//!
//! Concurrent:            input
//!                          │
//!              ┌───────────┼───────────┐
//!              ▼           ▼           ▼
//!            Task A      Task B      Task C     (same superstep)
//!              └───────────┼───────────┘
//!                          ▼
//!                      aggregator                (fan-in)
//! ```

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::builder::WorkflowBuilder;
use crate::context::WorkflowContext;
use crate::executor::{Executor, Handler, HandlerRegistry};
use crate::message::Payload;
use crate::types::{BuildError, ExecutorError, ExecutorId};
use crate::workflow::{Workflow, WorkflowConfig};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("No participants added to pattern")]
    NoParticipants,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Build(#[from] BuildError),
}

pub type PatternResult<T> = Result<T, PatternError>;

/// Deferred `add_executor` call, so participants of different types can be
/// collected before the graph is assembled.
type Registration = Box<dyn FnOnce(WorkflowBuilder) -> WorkflowBuilder + Send>;

struct Participant {
    id: ExecutorId,
    register: Registration,
}

impl Participant {
    fn new<E: Executor>(executor: E) -> Self {
        Self {
            id: executor.id().clone(),
            register: Box::new(move |builder| builder.add_executor(executor)),
        }
    }
}

// ============================================================================
// SEQUENTIAL
// ============================================================================

/// Chains participants so each one's messages feed the next.
pub struct SequentialBuilder {
    id: String,
    name: Option<String>,
    participants: Vec<Participant>,
    config: WorkflowConfig,
}

impl SequentialBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            participants: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a participant. Participants run in the order they are added.
    pub fn add_participant<E: Executor>(mut self, executor: E) -> Self {
        self.participants.push(Participant::new(executor));
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// # Errors
    ///
    /// `NoParticipants` for an empty chain, or the underlying build error.
    pub fn build(self) -> PatternResult<Workflow> {
        let first = self
            .participants
            .first()
            .map(|p| p.id.clone())
            .ok_or(PatternError::NoParticipants)?;

        let mut builder = WorkflowBuilder::new(self.id);
        if let Some(name) = self.name {
            builder = builder.name(name);
        }

        let ids: Vec<ExecutorId> = self.participants.iter().map(|p| p.id.clone()).collect();
        for participant in self.participants {
            builder = (participant.register)(builder);
        }
        builder = builder.set_start_executor(first);
        for pair in ids.windows(2) {
            builder = builder.add_edge(pair[0].clone(), pair[1].clone());
        }

        Ok(builder.with_config(self.config).build()?)
    }
}

// ============================================================================
// CONCURRENT
// ============================================================================

/// Broadcasts whatever it receives to every outgoing edge.
struct Dispatcher {
    id: ExecutorId,
}

impl Executor for Dispatcher {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on_any()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<Payload> for Dispatcher {
    async fn handle(&mut self, payload: Payload, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.send_payload(payload, None);
        Ok(())
    }
}

/// Default aggregator: yields the joined results as `Vec<serde_json::Value>`.
struct Collector {
    id: ExecutorId,
}

impl Executor for Collector {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on_any()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<Payload> for Collector {
    async fn handle(&mut self, batch: Payload, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        let results: Vec<Value> = match batch.data {
            Value::Array(items) => items,
            other => vec![other],
        };
        debug!(executor_id = %self.id, results = results.len(), "Aggregated concurrent results");
        ctx.yield_output(&results)
    }
}

/// Fans the input out to every participant and joins their results.
///
/// Each participant must send exactly one message per input for the join
/// to fire.
pub struct ConcurrentBuilder {
    id: String,
    name: Option<String>,
    participants: Vec<Participant>,
    aggregator: Option<Participant>,
    config: WorkflowConfig,
}

impl ConcurrentBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            participants: Vec::new(),
            aggregator: None,
            config: WorkflowConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn add_participant<E: Executor>(mut self, executor: E) -> Self {
        self.participants.push(Participant::new(executor));
        self
    }

    /// Replace the default aggregator. It receives the fan-in batch, so it
    /// needs an `on_batch` or catch-all handler.
    pub fn with_aggregator<E: Executor>(mut self, executor: E) -> Self {
        self.aggregator = Some(Participant::new(executor));
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn dispatcher_id(&self) -> ExecutorId {
        ExecutorId::new(format!("{}-dispatcher", self.id))
    }

    pub fn aggregator_id(&self) -> ExecutorId {
        self.aggregator
            .as_ref()
            .map(|a| a.id.clone())
            .unwrap_or_else(|| ExecutorId::new(format!("{}-aggregator", self.id)))
    }

    /// # Errors
    ///
    /// `NoParticipants` if nothing was added, `InvalidConfiguration` if a
    /// participant reuses the dispatcher or aggregator id, or the underlying
    /// build error.
    pub fn build(self) -> PatternResult<Workflow> {
        if self.participants.is_empty() {
            return Err(PatternError::NoParticipants);
        }
        let dispatcher_id = self.dispatcher_id();
        let aggregator_id = self.aggregator_id();
        if let Some(clash) = self
            .participants
            .iter()
            .find(|p| p.id == dispatcher_id || p.id == aggregator_id)
        {
            return Err(PatternError::InvalidConfiguration(format!(
                "participant '{}' collides with a reserved executor id",
                clash.id
            )));
        }

        let mut builder = WorkflowBuilder::new(self.id);
        if let Some(name) = self.name {
            builder = builder.name(name);
        }

        builder = builder.add_executor(Dispatcher {
            id: dispatcher_id.clone(),
        });
        builder = match self.aggregator {
            Some(aggregator) => (aggregator.register)(builder),
            None => builder.add_executor(Collector {
                id: aggregator_id.clone(),
            }),
        };

        let ids: Vec<ExecutorId> = self.participants.iter().map(|p| p.id.clone()).collect();
        for participant in self.participants {
            builder = (participant.register)(builder);
        }

        Ok(builder
            .set_start_executor(dispatcher_id.clone())
            .add_fan_out_edges(dispatcher_id, ids.clone())
            .add_fan_in_edges(ids, aggregator_id)
            .with_config(self.config)
            .build()?)
    }
}
