//! Checkpoints - Durable, superstep-aligned snapshots of a run.
//!
//! A checkpoint is only written between supersteps, so it never captures a
//! partially delivered message. Restoring one reconstructs executors,
//! re-seeds the pending-request table and shared state, and continues with
//! the captured in-flight messages as the next superstep's input.
//!
//! # Example
//!
//! ```rust,ignore
//! let storage = Arc::new(FileCheckpointStorage::new("/var/lib/workflows"));
//!
//! let mut workflow = WorkflowBuilder::new("migration")
//!     // ...
//!     .with_config(WorkflowConfig::default().with_checkpointing(true))
//!     .with_checkpoint_storage(storage.clone())
//!     .build()?;
//!
//! // After a crash:
//! if let Some(latest) = storage.latest(workflow.id()).await? {
//!     let mut stream = workflow.run_stream_from_checkpoint(&latest.checkpoint_id).await?;
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::message::{Message, Payload};
use crate::request_info::PendingRequest;
use crate::types::{CheckpointError, CheckpointId, ExecutorId, WorkflowId};

/// Current on-disk layout version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// CHECKPOINT
// ============================================================================

/// A consistent cut of a run: scheduler state plus every executor's blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub workflow_id: WorkflowId,
    /// Supersteps completed when the checkpoint was taken.
    pub iteration_count: u32,
    pub timestamp: DateTime<Utc>,
    /// Blobs from `on_checkpoint_save`. Executors without state are absent.
    pub executor_states: BTreeMap<ExecutorId, Value>,
    /// In-flight messages keyed by target executor.
    pub messages: BTreeMap<ExecutorId, Vec<Message>>,
    pub pending_requests: Vec<PendingRequest>,
    pub shared_state: HashMap<String, Value>,
    /// Partially filled fan-in joins, keyed by edge group id.
    #[serde(default)]
    pub fan_in_buffers: BTreeMap<String, BTreeMap<ExecutorId, Payload>>,
    #[serde(default)]
    pub stall_count: u32,
    /// Topology the checkpoint was taken from.
    pub graph_signature: String,
    pub schema_version: u32,
}

impl WorkflowCheckpoint {
    /// Number of queued messages across all targets.
    pub fn in_flight_message_count(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            workflow_id: self.workflow_id.clone(),
            iteration_count: self.iteration_count,
            timestamp: self.timestamp,
            pending_request_count: self.pending_requests.len(),
            in_flight_message_count: self.in_flight_message_count(),
        }
    }
}

/// Lightweight metadata for listing checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: CheckpointId,
    pub workflow_id: WorkflowId,
    pub iteration_count: u32,
    pub timestamp: DateTime<Utc>,
    pub pending_request_count: usize,
    pub in_flight_message_count: usize,
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Durable store for checkpoints. Outlives any single run.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<CheckpointId, CheckpointError>;

    async fn load(&self, checkpoint_id: &CheckpointId)
        -> Result<WorkflowCheckpoint, CheckpointError>;

    /// Checkpoints of one workflow, oldest first.
    async fn list(&self, workflow_id: &WorkflowId)
        -> Result<Vec<WorkflowCheckpoint>, CheckpointError>;

    /// Returns whether a checkpoint was removed.
    async fn delete(&self, checkpoint_id: &CheckpointId) -> Result<bool, CheckpointError>;

    async fn list_summaries(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        Ok(self
            .list(workflow_id)
            .await?
            .iter()
            .map(WorkflowCheckpoint::summary)
            .collect())
    }

    async fn latest(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        Ok(self.list(workflow_id).await?.pop())
    }

    /// Keep the newest `keep` checkpoints of a workflow. Returns how many were deleted.
    async fn cleanup_keep_last(
        &self,
        workflow_id: &WorkflowId,
        keep: usize,
    ) -> Result<usize, CheckpointError> {
        let checkpoints = self.list(workflow_id).await?;
        let excess = checkpoints.len().saturating_sub(keep);
        let mut deleted = 0;
        for checkpoint in checkpoints.iter().take(excess) {
            if self.delete(&checkpoint.checkpoint_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn sort_oldest_first(checkpoints: &mut [WorkflowCheckpoint]) {
    checkpoints.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.iteration_count.cmp(&b.iteration_count))
    });
}

// ============================================================================
// IN-MEMORY STORAGE
// ============================================================================

/// Ephemeral storage for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStorage {
    checkpoints: RwLock<HashMap<CheckpointId, WorkflowCheckpoint>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<CheckpointId, CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(checkpoint.checkpoint_id.clone())
    }

    async fn load(
        &self,
        checkpoint_id: &CheckpointId,
    ) -> Result<WorkflowCheckpoint, CheckpointError> {
        self.checkpoints
            .read()
            .await
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))
    }

    async fn list(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowCheckpoint>, CheckpointError> {
        let mut found: Vec<WorkflowCheckpoint> = self
            .checkpoints
            .read()
            .await
            .values()
            .filter(|c| &c.workflow_id == workflow_id)
            .cloned()
            .collect();
        sort_oldest_first(&mut found);
        Ok(found)
    }

    async fn delete(&self, checkpoint_id: &CheckpointId) -> Result<bool, CheckpointError> {
        Ok(self.checkpoints.write().await.remove(checkpoint_id).is_some())
    }
}

// ============================================================================
// FILE STORAGE
// ============================================================================

/// One pretty-printed JSON file per checkpoint: `<dir>/<checkpoint_id>.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStorage {
    dir: PathBuf,
}

impl FileCheckpointStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, checkpoint_id: &CheckpointId) -> Result<PathBuf, CheckpointError> {
        let id = checkpoint_id.as_str();
        let invalid = id.is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\'])
            || id.contains('\0');
        if invalid {
            return Err(CheckpointError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read_all(&self) -> Result<Vec<WorkflowCheckpoint>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<WorkflowCheckpoint>(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable checkpoint file");
                }
            }
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStorage {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<CheckpointId, CheckpointError> {
        let path = self.path_for(&checkpoint.checkpoint_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&path, json).await?;
        debug!(checkpoint_id = %checkpoint.checkpoint_id, path = %path.display(), "Checkpoint written");
        Ok(checkpoint.checkpoint_id.clone())
    }

    async fn load(
        &self,
        checkpoint_id: &CheckpointId,
    ) -> Result<WorkflowCheckpoint, CheckpointError> {
        let path = self.path_for(checkpoint_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(checkpoint_id.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowCheckpoint>, CheckpointError> {
        let mut found: Vec<WorkflowCheckpoint> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|c| &c.workflow_id == workflow_id)
            .collect();
        sort_oldest_first(&mut found);
        Ok(found)
    }

    async fn delete(&self, checkpoint_id: &CheckpointId) -> Result<bool, CheckpointError> {
        let path = self.path_for(checkpoint_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint(id: &str, workflow: &str, iteration: u32) -> WorkflowCheckpoint {
        let mut messages = BTreeMap::new();
        messages.insert(
            ExecutorId::new("reverse"),
            vec![Message::new(
                Payload::new(&"HELLO".to_string()).unwrap(),
                ExecutorId::new("upper"),
                None,
            )],
        );
        let mut executor_states = BTreeMap::new();
        executor_states.insert(ExecutorId::new("counter"), serde_json::json!({"seen": 3}));

        WorkflowCheckpoint {
            checkpoint_id: CheckpointId::new(id),
            workflow_id: WorkflowId::new(workflow),
            iteration_count: iteration,
            timestamp: Utc::now() + Duration::milliseconds(iteration as i64),
            executor_states,
            messages,
            pending_requests: Vec::new(),
            shared_state: HashMap::new(),
            fan_in_buffers: BTreeMap::new(),
            stall_count: 0,
            graph_signature: "sig".to_string(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
        }
    }

    #[tokio::test]
    async fn test_inmemory_save_load() {
        let storage = InMemoryCheckpointStorage::new();
        let cp = checkpoint("ckpt-1", "wf", 1);

        let id = storage.save(&cp).await.unwrap();
        assert_eq!(id.as_str(), "ckpt-1");
        assert_eq!(storage.load(&id).await.unwrap(), cp);

        let missing = storage.load(&CheckpointId::new("nope")).await.unwrap_err();
        assert!(matches!(missing, CheckpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_inmemory_list_is_ordered_and_scoped() {
        let storage = InMemoryCheckpointStorage::new();
        storage.save(&checkpoint("ckpt-3", "wf", 3)).await.unwrap();
        storage.save(&checkpoint("ckpt-1", "wf", 1)).await.unwrap();
        storage.save(&checkpoint("other", "wf-other", 2)).await.unwrap();

        let listed = storage.list(&WorkflowId::new("wf")).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.checkpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["ckpt-1", "ckpt-3"]);

        let latest = storage.latest(&WorkflowId::new("wf")).await.unwrap().unwrap();
        assert_eq!(latest.iteration_count, 3);
    }

    #[tokio::test]
    async fn test_cleanup_keep_last() {
        let storage = InMemoryCheckpointStorage::new();
        for i in 1..=5 {
            storage
                .save(&checkpoint(&format!("ckpt-{i}"), "wf", i))
                .await
                .unwrap();
        }

        let deleted = storage
            .cleanup_keep_last(&WorkflowId::new("wf"), 2)
            .await
            .unwrap();
        assert_eq!(deleted, 3);

        let remaining = storage.list(&WorkflowId::new("wf")).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].checkpoint_id.as_str(), "ckpt-4");
    }

    #[tokio::test]
    async fn test_summaries() {
        let storage = InMemoryCheckpointStorage::new();
        storage.save(&checkpoint("ckpt-1", "wf", 1)).await.unwrap();
        let summaries = storage.list_summaries(&WorkflowId::new("wf")).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].in_flight_message_count, 1);
        assert_eq!(summaries[0].pending_request_count, 0);
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCheckpointStorage::new(dir.path().join("checkpoints"));
        let cp = checkpoint("ckpt-1", "wf", 1);

        storage.save(&cp).await.unwrap();
        assert!(dir.path().join("checkpoints/ckpt-1.json").exists());
        assert_eq!(storage.load(&cp.checkpoint_id).await.unwrap(), cp);

        assert!(storage.delete(&cp.checkpoint_id).await.unwrap());
        assert!(!storage.delete(&cp.checkpoint_id).await.unwrap());
        assert!(matches!(
            storage.load(&cp.checkpoint_id).await.unwrap_err(),
            CheckpointError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_file_storage_lists_missing_dir_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCheckpointStorage::new(dir.path().join("never-created"));
        assert!(storage.list(&WorkflowId::new("wf")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_storage_skips_corrupt_files_in_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCheckpointStorage::new(dir.path());
        storage.save(&checkpoint("ckpt-1", "wf", 1)).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();

        let listed = storage.list(&WorkflowId::new("wf")).await.unwrap();
        assert_eq!(listed.len(), 1);

        let err = storage.load(&CheckpointId::new("broken")).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Serialization(_)));
        // A failed load leaves the file in place.
        assert!(dir.path().join("broken.json").exists());
    }

    #[tokio::test]
    async fn test_file_storage_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCheckpointStorage::new(dir.path());
        let err = storage
            .load(&CheckpointId::new("../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidId(_)));
    }
}
