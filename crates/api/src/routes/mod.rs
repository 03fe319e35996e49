//! HTTP handlers.

pub mod executions;
pub mod health;
pub mod metrics;
pub mod workflows;
