//! Error taxonomy (§7).
//!
//! Two distinct error types, mirroring the teacher's split between a small
//! `thiserror` enum at one collaborator boundary and `anyhow::Error`
//! everywhere else: [`OrchestratorError`] is what the public API returns;
//! [`TaskErrorKind`] is the classification stored on a task and reported in
//! [`crate::types::TaskView`] once an attempt fails.

use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// Classification of a single task attempt's failure (§7). Stored on the
/// task alongside a free-text detail message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskErrorKind {
    /// Submission was malformed: missing files, unknown model, empty format
    /// list. Never retried.
    InputInvalid,
    /// No GPU could admit the task within the configured window. Retried
    /// with backoff.
    ResourceUnavailable,
    /// The transcription engine returned a transient failure (OOM under
    /// contention, timeout on a single call). Retried.
    EngineTransient,
    /// The transcription engine returned a non-recoverable failure
    /// (corrupt model, unsupported input). Never retried.
    EngineFatal,
    /// The task exceeded its configured wall-clock budget. Never retried.
    TaskTimeout,
    /// The client requested cancellation. Never retried.
    ClientCancelled,
    /// Anything else: channel closed, join error, bug. Never retried.
    Internal,
}

impl TaskErrorKind {
    /// Whether a failure of this kind is eligible for another attempt,
    /// subject to the task's remaining retry budget (§7, §4.5).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TaskErrorKind::ResourceUnavailable | TaskErrorKind::EngineTransient
        )
    }
}

/// Error returned by the public orchestrator API (§6.1).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No task exists with the given id.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// Submission failed validation before a task id was even allocated.
    #[error("invalid task submission: {0}")]
    InvalidSpec(String),

    /// The orchestrator is shutting down and no longer accepts operations.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// Anything else: an internal invariant broke, a channel closed
    /// unexpectedly, a collaborator misbehaved.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for fallible public operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_resource_errors_retry() {
        assert!(TaskErrorKind::ResourceUnavailable.is_retryable());
        assert!(TaskErrorKind::EngineTransient.is_retryable());
        assert!(!TaskErrorKind::EngineFatal.is_retryable());
        assert!(!TaskErrorKind::InputInvalid.is_retryable());
        assert!(!TaskErrorKind::TaskTimeout.is_retryable());
        assert!(!TaskErrorKind::ClientCancelled.is_retryable());
        assert!(!TaskErrorKind::Internal.is_retryable());
    }

    #[test]
    fn task_not_found_formats_with_id() {
        let err = OrchestratorError::TaskNotFound(42);
        assert_eq!(err.to_string(), "task 42 not found");
    }
}
