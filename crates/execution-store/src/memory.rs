use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    ExecutionId, ExecutionQuery, ExecutionStatus, Result, StepStatus, StoreError,
    WorkflowExecution, WorkflowStepEvent,
    store::{ExecutionStore, matches_query},
};

/// In-memory execution store implementation for testing.
///
/// This implementation keeps all records in memory and provides
/// the same interface as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    executions: Arc<RwLock<HashMap<ExecutionId, WorkflowExecution>>>,
    step_events: Arc<RwLock<Vec<WorkflowStepEvent>>>,
}

impl InMemoryExecutionStore {
    /// Creates a new empty in-memory execution store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of executions stored.
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }

    /// Returns the total number of step events stored.
    pub async fn step_event_count(&self) -> usize {
        self.step_events.read().await.len()
    }

    /// Clears all executions and step events.
    pub async fn clear(&self) {
        self.executions.write().await.clear();
        self.step_events.write().await.clear();
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::DuplicateExecution(execution.id));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(stored) => {
                *stored = execution.clone();
                Ok(())
            }
            None => Err(StoreError::ExecutionNotFound(execution.id)),
        }
    }

    async fn update_execution_if(
        &self,
        execution: &WorkflowExecution,
        expected: ExecutionStatus,
    ) -> Result<bool> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(stored) if stored.status == expected => {
                *stored = execution.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::ExecutionNotFound(execution.id)),
        }
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.get(&id).cloned())
    }

    async fn find_executions(&self, query: ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let executions = self.executions.read().await;
        let mut matching: Vec<_> = executions
            .values()
            .filter(|e| matches_query(e, &query))
            .cloned()
            .collect();

        // Sort by start time then ID for a stable order
        matching.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.id.as_uuid().cmp(&b.id.as_uuid()))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn append_step_event(&self, event: &WorkflowStepEvent) -> Result<()> {
        if !self.executions.read().await.contains_key(&event.execution_id) {
            return Err(StoreError::ExecutionNotFound(event.execution_id));
        }
        self.step_events.write().await.push(event.clone());
        Ok(())
    }

    async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<WorkflowStepEvent>> {
        let events = self.step_events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn find_stale_steps(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<WorkflowStepEvent>> {
        let events = self.step_events.read().await;
        let stale = events
            .iter()
            .filter(|e| e.status == StepStatus::Started && e.started_at < started_before)
            .filter(|started| {
                !events
                    .iter()
                    .any(|e| e.status.is_finished() && e.same_step(started))
            })
            .cloned()
            .collect();
        Ok(stale)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut executions = self.executions.write().await;
        let expired: Vec<ExecutionId> = executions
            .values()
            .filter(|e| e.status.is_terminal())
            .filter(|e| e.finished_at.is_some_and(|finished| finished < cutoff))
            .map(|e| e.id)
            .collect();

        for id in &expired {
            executions.remove(id);
        }

        let mut events = self.step_events.write().await;
        events.retain(|e| !expired.contains(&e.execution_id));

        Ok(expired.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
