//! Shared types for the workflow engine crates.

pub mod backoff;
pub mod types;

pub use backoff::exponential_backoff;
pub use types::ExecutionId;
