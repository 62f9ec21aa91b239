//! Graph Workflow Engine
//!
//! Runs a directed graph of message-passing executors in synchronized
//! supersteps:
//! - **Executors** own private state and one handler per message type
//! - **Edges** route typed messages: direct, conditional, switch-case,
//!   fan-out, fan-in and loop
//! - **RequestInfo** suspends the run until the caller answers
//! - **Checkpoints** capture a consistent cut at every superstep boundary
//! - **Sub-workflows** embed a whole workflow as a single node
//!
//! # Architecture
//!
//! ```text
//!   WorkflowBuilder ──build()──▶ Workflow
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!            ▼                      ▼                      ▼
//!      superstep loop          Router (edges)      CheckpointStorage
//!            │
//!            ▼
//!   executors (concurrent) ──▶ WorkflowEvent stream
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use dasein_agentic_workflow::{WorkflowBuilder, WorkflowEvent};
//! use futures::StreamExt;
//!
//! let mut workflow = WorkflowBuilder::new("text")
//!     .add_executor(Upper::new("upper"))
//!     .add_executor(Reverse::new("reverse"))
//!     .set_start_executor("upper")
//!     .add_edge("upper", "reverse")
//!     .build()?;
//!
//! let mut events = workflow.run_stream(&"hello world".to_string()).await?;
//! while let Some(event) = events.next().await {
//!     if let Some(text) = event.output_as::<String>() {
//!         println!("{text}");
//!     }
//! }
//! ```

pub mod agent;
pub mod builder;
pub mod checkpoint;
pub mod context;
pub mod edge;
pub mod events;
pub mod executor;
pub mod message;
pub mod patterns;
pub mod request_info;
mod router;
pub mod sub_workflow;
pub mod types;
pub mod viz;
pub mod workflow;

pub use agent::{
    Agent, AgentError, AgentExecutor, AgentRequest, AgentRunResponse, AgentThread, ChatMessage,
    ChatRole, FinishReason, UsageDetails,
};
pub use builder::{ExecutorInfo, ValidationReport, WorkflowBuilder, WorkflowGraph};
pub use checkpoint::{
    CheckpointStorage, CheckpointSummary, FileCheckpointStorage, InMemoryCheckpointStorage,
    WorkflowCheckpoint, CHECKPOINT_SCHEMA_VERSION,
};
pub use context::{InMemoryStateBackend, SharedStateBackend, WorkflowContext};
pub use edge::{Case, Edge, EdgeCondition, EdgeGroup, EdgeKind};
pub use events::{RunState, TerminationReason, WorkflowEvent};
pub use executor::{Executor, Handler, HandlerRegistry};
pub use message::{Message, Payload, RequestResponse};
pub use patterns::{ConcurrentBuilder, PatternError, PatternResult, SequentialBuilder};
pub use request_info::{PendingRequest, PendingRequestTable, Responses};
pub use sub_workflow::{Intercept, RequestInterceptor, WorkflowExecutor};
pub use types::{
    BuildError, CheckpointError, CheckpointId, CorrelationError, ExecutorError, ExecutorId,
    RequestId, TypeTag, WorkflowError, WorkflowId, WorkflowResult,
};
pub use viz::WorkflowViz;
pub use workflow::{
    EventStream, FailurePolicy, Workflow, WorkflowConfig, WorkflowRunResult, INPUT_SOURCE,
};
