//! Workflow error types.

use common::ExecutionId;
use execution_store::{ExecutionStatus, StoreError};
use locks::LockError;
use thiserror::Error;

use crate::step::StepError;

/// Errors that can occur while registering or running workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No workflow is registered under the requested name.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A workflow with this name is already registered.
    #[error("Workflow already registered: {0}")]
    DuplicateWorkflowName(String),

    /// The supplied input does not match the registered input type.
    #[error("Input type mismatch for workflow '{workflow}': expected {expected}, got {actual}")]
    InputTypeMismatch {
        workflow: String,
        expected: String,
        actual: String,
    },

    /// The requested output type does not match the registered output type.
    #[error("Output type mismatch for workflow '{workflow}': expected {expected}, got {actual}")]
    OutputTypeMismatch {
        workflow: String,
        expected: String,
        actual: String,
    },

    /// The business-key lock could not be obtained within the bounded wait.
    #[error("Could not acquire lock on '{0}'")]
    LockAcquisitionFailed(String),

    /// A step returned an error; this triggers the unwind.
    #[error("Step '{step}' failed: {source}")]
    StepExecutionFailed {
        step: String,
        #[source]
        source: StepError,
    },

    /// A single compensation failed during unwind.
    #[error("Compensation for step '{step}' (index {step_index}) failed: {source}")]
    CompensationFailed {
        step: String,
        step_index: u32,
        #[source]
        source: StepError,
    },

    /// The execution passed its deadline.
    #[error("Execution {0} exceeded its timeout")]
    TimeoutExceeded(ExecutionId),

    /// The execution was cancelled by a caller.
    #[error("Execution {0} was cancelled")]
    Cancelled(ExecutionId),

    /// A parallel group exceeded the configured bound.
    #[error("Parallel group of {size} operations exceeds the limit of {limit}")]
    ParallelGroupTooLarge { size: usize, limit: usize },

    /// The execution failed and was unwound.
    ///
    /// `status` tells a clean rollback (`Compensated`) from one that needs
    /// manual reconciliation (`PartiallyCompensated`).
    #[error("Execution {execution_id} failed ({status}): {cause}")]
    ExecutionFailed {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        compensation_failures: Vec<WorkflowError>,
        #[source]
        cause: Box<WorkflowError>,
    },

    /// Every step succeeded but the `Completed` status could not be written.
    ///
    /// The stored row stays `Running` until the timeout sweep settles it.
    #[error("Execution {execution_id} completed but its status could not be recorded: {source}")]
    CompletionNotRecorded {
        execution_id: ExecutionId,
        #[source]
        source: StoreError,
    },

    /// Only fully compensated executions can be retried.
    #[error("Execution {execution_id} cannot be retried from status {status}")]
    NotRetryable {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    /// Execution store error.
    #[error("Execution store error: {0}")]
    Store(#[from] StoreError),

    /// Lock provider error.
    #[error("Lock provider error: {0}")]
    Lock(#[from] LockError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Returns true if re-running the workflow later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::StepExecutionFailed { source, .. } => source.retryable,
            WorkflowError::TimeoutExceeded(_)
            | WorkflowError::Store(_)
            | WorkflowError::Lock(_)
            | WorkflowError::LockAcquisitionFailed(_) => true,
            WorkflowError::ExecutionFailed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Returns the final status if this is an `ExecutionFailed` error.
    pub fn final_status(&self) -> Option<ExecutionStatus> {
        match self {
            WorkflowError::ExecutionFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the error that triggered the unwind, or `self` otherwise.
    pub fn root_cause(&self) -> &WorkflowError {
        match self {
            WorkflowError::ExecutionFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_retryability_follows_step_error() {
        let transient = WorkflowError::StepExecutionFailed {
            step: "authorize-payment".to_string(),
            source: StepError::transient("gateway timeout"),
        };
        let permanent = WorkflowError::StepExecutionFailed {
            step: "authorize-payment".to_string(),
            source: StepError::permanent("card declined"),
        };

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!WorkflowError::WorkflowNotFound("x".to_string()).is_retryable());
    }

    #[test]
    fn execution_failed_exposes_cause_and_status() {
        let id = ExecutionId::new();
        let err = WorkflowError::ExecutionFailed {
            execution_id: id,
            status: ExecutionStatus::Compensated,
            compensation_failures: vec![],
            cause: Box::new(WorkflowError::TimeoutExceeded(id)),
        };

        assert_eq!(err.final_status(), Some(ExecutionStatus::Compensated));
        assert!(matches!(err.root_cause(), WorkflowError::TimeoutExceeded(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("COMPENSATED"));
    }
}
