use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ExecutionId, ExecutionQuery, ExecutionStatus, Result, StoreError, WorkflowExecution,
    WorkflowStepEvent,
};

/// Core trait for execution store implementations.
///
/// The engine writes one execution at a time from the task that owns it;
/// the maintenance loop only moves executions through conditional
/// transitions. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts a new execution.
    ///
    /// Fails with `DuplicateExecution` if an execution with the same ID exists.
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Replaces the stored execution (last write wins).
    ///
    /// Fails with `ExecutionNotFound` if the execution was never inserted.
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Replaces the stored execution only if its current status is `expected`.
    ///
    /// Returns false, without writing, if the status has moved on.
    async fn update_execution_if(
        &self,
        execution: &WorkflowExecution,
        expected: ExecutionStatus,
    ) -> Result<bool>;

    /// Retrieves an execution by ID.
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>>;

    /// Retrieves executions matching a query, oldest start first.
    async fn find_executions(&self, query: ExecutionQuery) -> Result<Vec<WorkflowExecution>>;

    /// Appends a step event.
    async fn append_step_event(&self, event: &WorkflowStepEvent) -> Result<()>;

    /// Retrieves all step events of an execution in recording order.
    async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<WorkflowStepEvent>>;

    /// Retrieves `Started` events older than `started_before` that have no
    /// matching `Completed` or `Failed` event.
    async fn find_stale_steps(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<WorkflowStepEvent>>;

    /// Deletes terminal executions finished before `cutoff`, with their step
    /// events. Returns the number of executions deleted.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Extension trait providing convenience methods for execution stores.
#[async_trait]
pub trait ExecutionStoreExt: ExecutionStore {
    /// Retrieves an execution, failing if it does not exist.
    async fn require_execution(&self, id: ExecutionId) -> Result<WorkflowExecution> {
        self.get_execution(id)
            .await?
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    /// Counts executions matching a query.
    async fn count_executions(&self, query: ExecutionQuery) -> Result<usize> {
        Ok(self.find_executions(query).await?.len())
    }
}

// Blanket implementation for all ExecutionStore implementations
impl<T: ExecutionStore + ?Sized> ExecutionStoreExt for T {}

/// Returns true if `execution` satisfies every filter in `query`.
///
/// Shared by implementations that filter in process.
pub fn matches_query(execution: &WorkflowExecution, query: &ExecutionQuery) -> bool {
    if let Some(ref statuses) = query.statuses
        && !statuses.contains(&execution.status)
    {
        return false;
    }
    if let Some(ref name) = query.workflow_name
        && &execution.workflow_name != name
    {
        return false;
    }
    if let Some(from) = query.started_after
        && execution.started_at < from
    {
        return false;
    }
    if let Some(to) = query.started_before
        && execution.started_at > to
    {
        return false;
    }
    if let Some(from) = query.finished_after
        && execution.finished_at.is_none_or(|finished| finished < from)
    {
        return false;
    }
    if let Some(to) = query.finished_before
        && execution.finished_at.is_none_or(|finished| finished > to)
    {
        return false;
    }
    if let Some(deadline) = query.timeout_before
        && execution.timeout_at > deadline
    {
        return false;
    }
    if let Some(retryable) = query.retryable
        && execution.retryable != retryable
    {
        return false;
    }
    if let Some(max_attempts) = query.attempts_below
        && execution.attempt_count >= max_attempts
    {
        return false;
    }
    true
}
