//! SystemDatabase trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::serialization::ErrorEnvelope;

/// Error type for system-database operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// `send` destination does not exist
    #[error("destination workflow not found: {0}")]
    DestinationNotFound(String),

    /// A (workflow, function) record exists with a different payload
    #[error("conflicting record for workflow {workflow_id} function {function_id}")]
    ConflictingRecord {
        workflow_id: String,
        function_id: u32,
    },

    /// A workflow row exists under this id for a different function
    #[error("workflow {workflow_id} already registered as {existing_name}")]
    ConflictingWorkflow {
        workflow_id: String,
        existing_name: String,
    },

    /// An event key was already set to a different value
    #[error("event {key} already set for workflow {workflow_id}")]
    EventAlreadySet { workflow_id: String, key: String },

    /// Awaited workflow terminated with a recorded error
    #[error("workflow failed: {0}")]
    WorkflowFailed(ErrorEnvelope),

    /// Awaited workflow was cancelled
    #[error("workflow cancelled: {0}")]
    WorkflowCancelled(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Terminal and non-terminal workflow states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Registered, running, or awaiting recovery
    Pending,
    /// Completed with a recorded output
    Success,
    /// Completed with a recorded error
    Error,
    /// A step exhausted its retry budget
    RetriesExceeded,
    /// Cancelled externally
    Cancelled,
}

impl WorkflowState {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::RetriesExceeded => "RETRIES_EXCEEDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse the stored representation
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "RETRIES_EXCEEDED" => Ok(Self::RetriesExceeded),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(StoreError::Database(format!(
                "unknown workflow state: {other}"
            ))),
        }
    }

    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `workflow_status`
#[derive(Debug, Clone)]
pub struct WorkflowStatusRow {
    pub workflow_id: String,
    pub status: WorkflowState,
    /// Registered workflow function name
    pub name: String,
    /// Serialized input arguments
    pub inputs: String,
    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Option<String>,
    /// Serialized request metadata from the caller
    pub request: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Process that currently owns the execution
    pub executor_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub application_version: Option<String>,
    pub queue_name: Option<String>,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl WorkflowStatusRow {
    /// A fresh PENDING row for a workflow about to start
    pub fn pending(
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        inputs: impl Into<String>,
        executor_id: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowState::Pending,
            name: name.into(),
            inputs: inputs.into(),
            authenticated_user: None,
            assumed_role: None,
            authenticated_roles: None,
            request: None,
            output: None,
            error: None,
            executor_id: Some(executor_id.into()),
            created_at: now_ms,
            updated_at: now_ms,
            application_version: None,
            queue_name: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A recorded step outcome
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Serialized output
    Output(String),
    /// Serialized error envelope
    Error(String),
}

/// A read-only transaction output held in memory until the next flush
#[derive(Debug, Clone)]
pub struct BufferedOutput {
    pub workflow_id: String,
    pub function_id: u32,
    pub output: String,
    pub txn_snapshot: Option<String>,
    pub created_at: i64,
}

/// A workflow status advance awaiting persistence
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub workflow_id: String,
    pub status: WorkflowState,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Identity of the workflow step performing a `get_event` call, used to
/// record the result for idempotent replay
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub workflow_id: String,
    pub function_id: u32,
}

/// Durable storage and cross-process signalling for the executor
///
/// Every mutation keyed by (workflow, function) is an upsert with an equality
/// check: a matching existing row succeeds silently, a divergent one raises
/// [`StoreError::ConflictingRecord`]. That property is what makes
/// side-effecting operations safe to re-issue during replay.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait SystemDatabase: Send + Sync + 'static {
    // =========================================================================
    // Workflow status
    // =========================================================================

    /// Insert a workflow row, or return the existing one
    ///
    /// Returns the stored row and whether this call created it. An existing
    /// row registered under a different function name is a conflict.
    async fn insert_workflow_status(
        &self,
        row: &WorkflowStatusRow,
    ) -> Result<(WorkflowStatusRow, bool), StoreError>;

    /// Apply a single status advance
    async fn update_workflow_status(&self, update: &StatusUpdate) -> Result<(), StoreError>;

    /// Apply a batch of buffered status advances
    async fn flush_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), StoreError>;

    /// Fetch a workflow row
    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRow>, StoreError>;

    /// Block until the workflow reaches a terminal state; return its output
    ///
    /// A recorded error surfaces as [`StoreError::WorkflowFailed`],
    /// cancellation as [`StoreError::WorkflowCancelled`].
    async fn await_workflow_result(
        &self,
        workflow_id: &str,
        poll_interval: Duration,
    ) -> Result<String, StoreError>;

    /// All PENDING workflows, for recovery
    async fn list_pending_workflows(&self) -> Result<Vec<WorkflowStatusRow>, StoreError>;

    /// Creation time of the most recent workflow whose id starts with
    /// `id_prefix`, for scheduler catch-up
    async fn latest_creation_with_prefix(
        &self,
        id_prefix: &str,
    ) -> Result<Option<i64>, StoreError>;

    // =========================================================================
    // Operation log (non-transactional steps)
    // =========================================================================

    /// Look up a recorded outcome for (workflow, function)
    async fn check_operation_output(
        &self,
        workflow_id: &str,
        function_id: u32,
    ) -> Result<Option<OperationOutcome>, StoreError>;

    /// Record a step output
    async fn record_operation_output(
        &self,
        workflow_id: &str,
        function_id: u32,
        output: &str,
    ) -> Result<(), StoreError>;

    /// Record a step error
    async fn record_operation_error(
        &self,
        workflow_id: &str,
        function_id: u32,
        error: &str,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Notifications and events
    // =========================================================================

    /// Deliver a message to (destination, topic), recording the send under
    /// the sender's (workflow, function) in the same transaction
    async fn send(
        &self,
        source_workflow_id: &str,
        function_id: u32,
        destination_workflow_id: &str,
        topic: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Consume the oldest message for (self, topic), waiting up to `timeout`
    ///
    /// The outcome (message or `None`) is recorded under (workflow, function)
    /// so a replay observes the same result without waiting.
    async fn recv(
        &self,
        workflow_id: &str,
        function_id: u32,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Publish a write-once key for this workflow
    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: u32,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Read a key published by `target_workflow_id`, waiting up to `timeout`
    ///
    /// When `caller` is set the result is recorded under the caller's
    /// (workflow, function) for idempotent replay.
    async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<&CallerContext>,
    ) -> Result<Option<String>, StoreError>;

    // =========================================================================
    // Workflow queue
    // =========================================================================

    /// Add a queue entry for an already-registered workflow row
    async fn enqueue_workflow(&self, queue: &str, workflow_id: &str) -> Result<(), StoreError>;

    /// Claim ready entries up to the queue's concurrency limit and mark them
    /// started; returns the workflow ids to launch
    async fn start_queued_workflows(
        &self,
        queue: &str,
        concurrency_limit: u32,
    ) -> Result<Vec<String>, StoreError>;

    /// Mark a queue entry finished, releasing its admission slot
    async fn mark_queue_entry_completed(&self, workflow_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Executor liveness
    // =========================================================================

    /// Refresh this executor's heartbeat
    async fn record_executor_heartbeat(
        &self,
        executor_id: &str,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    /// Executors whose last heartbeat is older than `now_ms - threshold_ms`
    async fn list_dead_executors(
        &self,
        threshold_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            WorkflowState::Pending,
            WorkflowState::Success,
            WorkflowState::Error,
            WorkflowState::RetriesExceeded,
            WorkflowState::Cancelled,
        ] {
            assert_eq!(WorkflowState::parse(state.as_str()).unwrap(), state);
        }
        assert!(WorkflowState::parse("RUNNING").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!WorkflowState::Pending.is_terminal());
        assert!(WorkflowState::Success.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
    }

    #[test]
    fn test_pending_row_defaults() {
        let row = WorkflowStatusRow::pending("wf-1", "checkout", "[42]", "exec-1", 1_000);
        assert_eq!(row.status, WorkflowState::Pending);
        assert_eq!(row.executor_id.as_deref(), Some("exec-1"));
        assert!(row.output.is_none());
        assert!(row.queue_name.is_none());
    }
}
