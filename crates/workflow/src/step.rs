//! The step contract.
//!
//! A step is one business operation inside a workflow. It produces an output
//! and, optionally, a compensation payload that its `compensate` function
//! receives if the execution later has to be unwound.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::context::WorkflowContext;

/// Error returned by a step's `execute` or `compensate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepError {
    /// Human-readable reason.
    pub message: String,
    /// Whether a later retry of the whole workflow may succeed.
    pub retryable: bool,
}

impl StepError {
    /// A failure that may go away on retry (timeouts, unavailable services).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on retry (validation, declines).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The value a step produced plus an optional compensation payload.
#[derive(Debug, Clone)]
pub struct StepOutput<T> {
    pub value: T,
    pub compensation_data: Option<serde_json::Value>,
}

impl<T> StepOutput<T> {
    /// Wraps a step result with no compensation payload.
    pub fn new(value: T) -> Self {
        Self {
            value,
            compensation_data: None,
        }
    }

    /// Attaches a payload handed to `compensate` during unwind.
    pub fn with_compensation_data(mut self, data: serde_json::Value) -> Self {
        self.compensation_data = Some(data);
        self
    }
}

impl<T> From<T> for StepOutput<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// One unit of work inside a workflow.
///
/// Steps are run through [`WorkflowContext::run_step`], which records their
/// transitions and registers their compensation. A step never invokes its own
/// compensation.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Step input, snapshotted into the step history.
    type Input: Serialize + Clone + Send + Sync + 'static;
    /// Step output, snapshotted into the step history.
    type Output: Serialize + Clone + Send + Sync + 'static;

    /// Name recorded in the step history.
    fn name(&self) -> &str;

    /// Performs the step.
    async fn execute(
        &self,
        input: &Self::Input,
        ctx: &WorkflowContext,
    ) -> Result<StepOutput<Self::Output>, StepError>;

    /// Whether a successful run registers a compensation.
    fn compensates(&self) -> bool {
        false
    }

    /// Semantically undoes a successful `execute`.
    async fn compensate(
        &self,
        _input: &Self::Input,
        _output: &Self::Output,
        _compensation_data: Option<&serde_json::Value>,
        _ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_constructors() {
        assert!(StepError::transient("timeout").retryable);
        assert!(!StepError::permanent("declined").retryable);
        assert_eq!(StepError::permanent("declined").to_string(), "declined");
    }

    #[test]
    fn step_output_carries_compensation_data() {
        let output = StepOutput::new(42).with_compensation_data(serde_json::json!({"hold": "H-1"}));
        assert_eq!(output.value, 42);
        assert_eq!(
            output.compensation_data,
            Some(serde_json::json!({"hold": "H-1"}))
        );

        let plain: StepOutput<&str> = "done".into();
        assert!(plain.compensation_data.is_none());
    }
}
