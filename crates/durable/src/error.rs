//! Error types surfaced to workflow and application code

use crate::persistence::StoreError;
use crate::serialization::ErrorEnvelope;

/// Errors raised by the durable runtime
///
/// Step and workflow functions return this type; recorded step errors are
/// rehydrated into the [`Recorded`](DurableError::Recorded) variant on replay
/// with the original name and message preserved.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// Workflow, step, or transaction name is not in the registry
    #[error("not registered: {0}")]
    NotRegistered(String),

    /// A (workflow, step) pair was recorded with a divergent payload
    ///
    /// Indicates a concurrent duplicate workflow id or a code change across
    /// retries. The workflow fails with this error recorded.
    #[error("conflicting record for workflow {workflow_id} step {function_id}")]
    Conflict {
        workflow_id: String,
        function_id: u32,
    },

    /// A step exhausted its retry budget
    #[error("step {step} exceeded {max_attempts} attempts: {cause}")]
    RetriesExceeded {
        step: String,
        max_attempts: u32,
        #[source]
        cause: Box<DurableError>,
    },

    /// The workflow was cancelled externally
    ///
    /// Never recorded as an operation outcome; the workflow terminates with
    /// status CANCELLED.
    #[error("workflow cancelled")]
    Cancelled,

    /// Replay mode found no recorded outcome for a step
    #[error("no recorded outcome for workflow {workflow_id} step {function_id} in replay")]
    Debugger {
        workflow_id: String,
        function_id: u32,
    },

    /// System database failure; fatal to the executor
    #[error("system database error: {0}")]
    SystemDatabase(#[from] StoreError),

    /// User database failure that survived the adapter's retry policy
    #[error("user database error: {0}")]
    UserDatabase(#[from] sqlx::Error),

    /// Argument or result (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid runtime configuration or registration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A previously recorded error, rehydrated from its stored envelope
    #[error("{0}")]
    Recorded(ErrorEnvelope),

    /// Error raised by user step or workflow code
    #[error("{0}")]
    Application(String),
}

impl DurableError {
    /// Error raised by application code inside a step or workflow
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// Whether this error must never be written to the operation log
    ///
    /// Cancellation is external and replay misses are tooling failures;
    /// recording either would poison subsequent re-executions.
    pub(crate) fn is_unrecordable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Debugger { .. } | Self::SystemDatabase(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = DurableError::NotRegistered("charge".to_string());
        assert_eq!(err.to_string(), "not registered: charge");

        let err = DurableError::Conflict {
            workflow_id: "wf-1".to_string(),
            function_id: 3,
        };
        assert!(err.to_string().contains("wf-1"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_retries_exceeded_preserves_cause() {
        let err = DurableError::RetriesExceeded {
            step: "flaky".to_string(),
            max_attempts: 3,
            cause: Box::new(DurableError::application("boom")),
        };
        assert!(err.to_string().contains("flaky"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_unrecordable_kinds() {
        assert!(DurableError::Cancelled.is_unrecordable());
        assert!(DurableError::Debugger {
            workflow_id: "w".to_string(),
            function_id: 0,
        }
        .is_unrecordable());
        assert!(!DurableError::application("x").is_unrecordable());
    }
}
