use thiserror::Error;

use crate::ExecutionId;

/// Errors that can occur when interacting with the execution store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An execution with this ID has already been inserted.
    #[error("Execution already exists: {0}")]
    DuplicateExecution(ExecutionId),

    /// The execution was not found in the store.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// A stored row could not be mapped back to a record.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for execution store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
