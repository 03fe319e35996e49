use std::time::Duration;

use common::ExecutionId;

/// Per-call options for [`WorkflowEngine::execute`](crate::WorkflowEngine::execute).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Business key serializing executions on the same entity.
    pub lock_key: Option<String>,
    /// Caller-supplied id carried into logs and the execution record.
    /// Defaults to the execution id.
    pub correlation_id: Option<String>,
    /// Overrides the engine's default timeout.
    pub timeout: Option<Duration>,
    /// Pre-assigned execution id.
    pub execution_id: Option<ExecutionId>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }
}
