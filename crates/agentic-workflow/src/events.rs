//! Events surfaced to the caller of a run.
//!
//! Every suspension and failure shows up here: a run ends with a
//! `RequestInfo` + `AwaitingInput`, a `Terminated`, a `Failed`, or a
//! `Completed` status.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::message::Payload;
use crate::request_info::PendingRequest;
use crate::types::{CheckpointId, ExecutorId, WorkflowId};

// ============================================================================
// RUN STATE
// ============================================================================

/// Scheduler state machine: `Idle → Running → (AwaitingInput | Completed | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    AwaitingInput,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::AwaitingInput => "awaiting_input",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Why a run stopped early without failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The superstep bound was reached with messages still queued.
    MaxSupersteps { limit: u32 },
    /// Too many consecutive supersteps produced no output.
    Stalled { supersteps: u32 },
}

// ============================================================================
// WORKFLOW EVENT
// ============================================================================

/// Closed set of events produced by executors and the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    Status {
        state: RunState,
    },
    SuperstepStarted {
        iteration: u32,
    },
    SuperstepCompleted {
        iteration: u32,
    },
    ExecutorInvoked {
        executor_id: ExecutorId,
    },
    ExecutorCompleted {
        executor_id: ExecutorId,
    },
    ExecutorFailed {
        executor_id: ExecutorId,
        error: String,
    },
    Output {
        executor_id: ExecutorId,
        payload: Payload,
    },
    Custom {
        executor_id: ExecutorId,
        event_type: String,
        data: Value,
    },
    RequestInfo {
        request: PendingRequest,
    },
    /// A message could not be routed and was dropped.
    RoutingWarning {
        source_id: ExecutorId,
        message: String,
    },
    CheckpointCreated {
        checkpoint_id: CheckpointId,
        iteration: u32,
    },
    /// An executor signalled completion of the whole run.
    Completed {
        executor_id: ExecutorId,
        payload: Payload,
    },
    Terminated {
        reason: TerminationReason,
    },
    Failed {
        error: String,
    },
}

impl WorkflowEvent {
    /// Decode the payload of an `Output` event.
    pub fn output_as<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            WorkflowEvent::Output { payload, .. } => payload.decode(),
            _ => None,
        }
    }

    /// Decode the payload of a `Completed` event.
    pub fn completion_as<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            WorkflowEvent::Completed { payload, .. } => payload.decode(),
            _ => None,
        }
    }

    pub fn is_request_info(&self) -> bool {
        matches!(self, WorkflowEvent::RequestInfo { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::ExecutorFailed { .. } | WorkflowEvent::Failed { .. }
        )
    }

    /// Short name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::Started { .. } => "started",
            WorkflowEvent::Status { .. } => "status",
            WorkflowEvent::SuperstepStarted { .. } => "superstep_started",
            WorkflowEvent::SuperstepCompleted { .. } => "superstep_completed",
            WorkflowEvent::ExecutorInvoked { .. } => "executor_invoked",
            WorkflowEvent::ExecutorCompleted { .. } => "executor_completed",
            WorkflowEvent::ExecutorFailed { .. } => "executor_failed",
            WorkflowEvent::Output { .. } => "output",
            WorkflowEvent::Custom { .. } => "custom",
            WorkflowEvent::RequestInfo { .. } => "request_info",
            WorkflowEvent::RoutingWarning { .. } => "routing_warning",
            WorkflowEvent::CheckpointCreated { .. } => "checkpoint_created",
            WorkflowEvent::Completed { .. } => "completed",
            WorkflowEvent::Terminated { .. } => "terminated",
            WorkflowEvent::Failed { .. } => "failed",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_as() {
        let event = WorkflowEvent::Output {
            executor_id: ExecutorId::new("upper"),
            payload: Payload::new(&"HELLO".to_string()).unwrap(),
        };
        assert_eq!(event.output_as::<String>(), Some("HELLO".to_string()));
        assert_eq!(event.completion_as::<String>(), None);
        assert_eq!(event.kind(), "output");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = WorkflowEvent::Status {
            state: RunState::AwaitingInput,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["state"], "awaiting_input");

        let back: WorkflowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_termination_reason_serialization() {
        let event = WorkflowEvent::Terminated {
            reason: TerminationReason::Stalled { supersteps: 3 },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["reason"]["kind"], "stalled");
        assert_eq!(value["reason"]["supersteps"], 3);
    }

    #[test]
    fn test_error_classification() {
        assert!(WorkflowEvent::Failed {
            error: "boom".into()
        }
        .is_error());
        assert!(!WorkflowEvent::SuperstepStarted { iteration: 0 }.is_error());
    }
}
