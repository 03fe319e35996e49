//! Mutual exclusion on caller-supplied business keys.
//!
//! The workflow engine serializes executions that touch the same logical
//! entity (for example `cart:complete:123`) by holding a lock on that key for
//! the duration of the execution. A lock carries a token identifying the
//! holder and an expiry that bounds how long a crashed holder can block
//! others.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod provider;

pub use error::{LockError, Result};
pub use memory::InMemoryLockProvider;
pub use postgres::PostgresLockProvider;
pub use provider::{AcquireOptions, LockProvider, LockProviderExt, LockToken};
