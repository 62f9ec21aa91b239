//! Core types for the workflow engine: identifiers, message type tags and
//! the error taxonomy (build, correlation, checkpoint, execution).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Unique identifier for an executor node in the graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ExecutorId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&ExecutorId> for ExecutorId {
    fn from(id: &ExecutorId) -> Self {
        id.clone()
    }
}

/// Unique identifier for a workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("wf-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Correlation id of an outstanding external request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(String);

impl CheckpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("ckpt-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// TYPE TAGS
// ============================================================================

/// Name of a concrete message type, used to resolve handlers and edge
/// targets without reflection.
///
/// Tags are derived from [`std::any::type_name`] and canonicalized so they
/// can be persisted in checkpoints:
/// - references are dropped, so `&T` and `T` share a tag
/// - `str` is tagged as `String`
/// - paths inside `std`, `core` and `alloc` keep only their last segment
///   (`alloc::string::String` becomes `String`)
///
/// Paths of your own types are kept whole. Fan-in deliveries use the
/// `[inner]` batch form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Tag of a concrete Rust type.
    pub fn of<T: ?Sized>() -> Self {
        Self(canonical_type_name(std::any::type_name::<T>()))
    }

    /// Tag of a fan-in batch whose members all carry `inner`.
    pub fn batch(inner: &TypeTag) -> Self {
        Self(format!("[{}]", inner.0))
    }

    /// Tag of a fan-in batch of `T`.
    pub fn batch_of<T: ?Sized>() -> Self {
        Self::batch(&Self::of::<T>())
    }

    pub fn is_batch(&self) -> bool {
        self.0.starts_with('[') && self.0.ends_with(']')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_type_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut path = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            path.push(c);
            continue;
        }
        push_path(&mut out, &mut path);
        match c {
            '&' => {
                // `&mut T` is rendered as "&mut T".
                let rest: String = chars.clone().take(4).collect();
                if rest == "mut " {
                    for _ in 0..4 {
                        chars.next();
                    }
                }
            }
            _ => out.push(c),
        }
    }
    push_path(&mut out, &mut path);
    out
}

fn push_path(out: &mut String, path: &mut String) {
    if path.is_empty() {
        return;
    }
    let std_path = ["std::", "core::", "alloc::"]
        .iter()
        .any(|prefix| path.starts_with(prefix));
    let segment = if std_path {
        path.rsplit("::").next().unwrap_or(path.as_str())
    } else {
        path.as_str()
    };
    out.push_str(if segment == "str" { "String" } else { segment });
    path.clear();
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Fatal, pre-run errors raised while assembling a graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Unknown executor '{executor_id}' referenced by {context}")]
    UnknownExecutor {
        executor_id: ExecutorId,
        context: String,
    },

    #[error("Executor '{0}' registered twice")]
    DuplicateExecutor(ExecutorId),

    #[error("Executor '{executor_id}' already has a handler for message type '{type_tag}'")]
    DuplicateHandler {
        executor_id: ExecutorId,
        type_tag: TypeTag,
    },

    #[error("Start executor not set")]
    MissingStart,

    #[error("Start executor already set to '{existing}', cannot also start at '{requested}'")]
    ConflictingStart {
        existing: ExecutorId,
        requested: ExecutorId,
    },

    #[error("Switch-case group from '{source_id}' declares more than one default")]
    MultipleDefaults { source_id: ExecutorId },

    #[error("Switch-case group from '{source_id}' has no cases")]
    EmptySwitch { source_id: ExecutorId },

    #[error("Fan-out group from '{source_id}' has no targets")]
    EmptyFanOut { source_id: ExecutorId },

    #[error("Fan-in group into '{target}' has no sources")]
    EmptyFanIn { target: ExecutorId },

    #[error("Fan-in group into '{target}' lists source '{source_id}' more than once")]
    DuplicateFanInSource {
        target: ExecutorId,
        source_id: ExecutorId,
    },

    #[error("Fan-in target '{target}' also has a direct edge from member '{source_id}'")]
    FanInConflict {
        target: ExecutorId,
        source_id: ExecutorId,
    },

    #[error("Edge '{0}' declared twice")]
    DuplicateEdge(String),

    #[error("Executor factory for '{expected}' produced an executor with id '{found}'")]
    FactoryMismatch {
        expected: ExecutorId,
        found: ExecutorId,
    },
}

/// Caller-facing errors raised by `send_responses_streaming`.
///
/// Raised before any scheduler state is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("No pending request with id '{0}'")]
    UnknownRequest(RequestId),

    #[error("Request id '{0}' is already pending")]
    DuplicateRequest(RequestId),

    #[error("Response to '{request_id}' does not match expected type '{expected}': {reason}")]
    TypeMismatch {
        request_id: RequestId,
        expected: TypeTag,
        reason: String,
    },

    #[error("No responses supplied")]
    EmptyResponses,
}

/// Errors from checkpoint storage and restore.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(CheckpointId),

    #[error("Invalid checkpoint id: {0}")]
    InvalidId(String),

    #[error("Checkpoint I/O error: {0}")]
    Io(String),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint was taken from a different graph (expected '{expected}', found '{found}')")]
    GraphMismatch { expected: String, found: String },

    #[error("Checkpoint schema version {found} is not supported (expected {expected})")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("Checkpoint references unknown executor '{0}'")]
    UnknownExecutor(ExecutorId),

    #[error("Executor '{executor_id}' failed to restore: {reason}")]
    RestoreFailed {
        executor_id: ExecutorId,
        reason: String,
    },

    #[error("No checkpoint storage configured")]
    StorageNotConfigured,
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Top-level error for workflow operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Start executor '{executor_id}' has no handler for input type '{type_tag}'")]
    UnsupportedInput {
        executor_id: ExecutorId,
        type_tag: TypeTag,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error raised by a handler. Isolated to the executor's branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorError {
    pub executor_id: ExecutorId,
    pub message: String,
    pub retriable: bool,
}

impl ExecutorError {
    pub fn new(executor_id: impl Into<ExecutorId>, message: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            message: message.into(),
            retriable: true,
        }
    }

    /// Create an internal error (non-retriable).
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            executor_id: ExecutorId::new("internal"),
            message: message.into(),
            retriable: false,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            executor_id: ExecutorId::new("validation"),
            message: message.into(),
            retriable: true,
        }
    }

    pub fn timeout(executor_id: impl Into<ExecutorId>, timeout_ms: u64) -> Self {
        Self {
            executor_id: executor_id.into(),
            message: format!("Handler timed out after {timeout_ms}ms"),
            retriable: true,
        }
    }

    pub fn non_retriable(mut self) -> Self {
        self.retriable = false;
        self
    }
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.executor_id, self.message)
    }
}

impl std::error::Error for ExecutorError {}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("Serialization error: {err}"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_id() {
        let id1 = ExecutorId::new("upper");
        let id2: ExecutorId = "upper".into();
        assert_eq!(id1, id2);
        assert_eq!(id1.as_str(), "upper");
    }

    #[test]
    fn test_generated_ids_have_prefixes() {
        assert!(WorkflowId::generate().as_str().starts_with("wf-"));
        assert!(RequestId::generate().as_str().starts_with("req-"));
        assert!(CheckpointId::generate().as_str().starts_with("ckpt-"));
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(TypeTag::of::<String>(), TypeTag::of::<String>());
        assert_ne!(TypeTag::of::<String>(), TypeTag::of::<u32>());

        let batch = TypeTag::batch_of::<String>();
        assert!(batch.is_batch());
        assert_eq!(batch, TypeTag::batch(&TypeTag::of::<String>()));
        assert!(!TypeTag::of::<String>().is_batch());
    }

    #[test]
    fn test_type_tags_are_canonical() {
        assert_eq!(TypeTag::of::<String>().as_str(), "String");
        assert_eq!(TypeTag::of::<&str>(), TypeTag::of::<String>());
        assert_eq!(TypeTag::of::<str>(), TypeTag::of::<String>());
        assert_eq!(TypeTag::of::<&u32>(), TypeTag::of::<u32>());
        assert_eq!(TypeTag::of::<&mut Vec<String>>().as_str(), "Vec<String>");
        assert_eq!(
            TypeTag::of::<std::collections::HashMap<String, Option<i64>>>().as_str(),
            "HashMap<String, Option<i64>>"
        );
        assert_eq!(
            TypeTag::of::<ExecutorId>().as_str(),
            "dasein_agentic_workflow::types::ExecutorId"
        );
        assert_eq!(TypeTag::of::<(u8, &str)>().as_str(), "(u8, String)");
    }

    #[test]
    fn test_type_tag_serializes_as_string() {
        let tag = TypeTag::new("demo::Msg");
        assert_eq!(serde_json::to_value(&tag).unwrap(), serde_json::json!("demo::Msg"));
    }

    #[test]
    fn test_executor_error() {
        let err = ExecutorError::new("validator", "bad input").non_retriable();
        assert!(!err.retriable);
        assert_eq!(err.to_string(), "[validator] bad input");
    }

    #[test]
    fn test_workflow_error_wraps_taxonomy() {
        let err: WorkflowError = BuildError::MissingStart.into();
        assert_eq!(err.to_string(), "Start executor not set");

        let err: WorkflowError = CorrelationError::UnknownRequest(RequestId::new("req-1")).into();
        assert!(matches!(err, WorkflowError::Correlation(_)));
    }

    #[test]
    fn test_executor_id_in_hashset() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ExecutorId::new("a"));
        set.insert(ExecutorId::new("b"));
        set.insert(ExecutorId::new("a"));
        assert_eq!(set.len(), 2);
    }
}
