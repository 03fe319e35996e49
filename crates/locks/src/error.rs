use thiserror::Error;

/// Errors raised by a lock backend.
///
/// A busy key is not an error: `acquire` reports it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Any other backend failure.
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
