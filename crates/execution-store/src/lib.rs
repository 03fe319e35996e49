//! Durable record of workflow executions and the step transitions within them.
//!
//! The store is the recovery substrate of the engine: every execution is
//! persisted as `RUNNING` before its first step starts, and every step start,
//! completion and failure is appended as a [`WorkflowStepEvent`]. The
//! maintenance loop scans these records for timed-out, stale and retryable
//! work.

pub mod error;
pub mod execution;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod step_event;
pub mod store;

pub use common::ExecutionId;
pub use error::{Result, StoreError};
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use query::ExecutionQuery;
pub use step_event::{StepEventId, StepStatus, WorkflowStepEvent};
pub use store::{ExecutionStore, ExecutionStoreExt};
