use chrono::{DateTime, Utc};

use crate::ExecutionStatus;

/// Builder for constructing execution queries.
///
/// Allows filtering executions by status, workflow name, age window,
/// deadline and retry eligibility. All set filters must match.
#[derive(Debug, Clone, Default)]
pub struct ExecutionQuery {
    /// Filter by status (any of these).
    pub statuses: Option<Vec<ExecutionStatus>>,

    /// Filter by workflow name.
    pub workflow_name: Option<String>,

    /// Filter by executions started at or after this timestamp.
    pub started_after: Option<DateTime<Utc>>,

    /// Filter by executions started at or before this timestamp.
    pub started_before: Option<DateTime<Utc>>,

    /// Filter by executions finished at or after this timestamp.
    pub finished_after: Option<DateTime<Utc>>,

    /// Filter by executions finished at or before this timestamp.
    pub finished_before: Option<DateTime<Utc>>,

    /// Filter by executions whose deadline is at or before this timestamp.
    pub timeout_before: Option<DateTime<Utc>>,

    /// Filter by retry classification of the last error.
    pub retryable: Option<bool>,

    /// Filter by executions with fewer attempts than this.
    pub attempts_below: Option<u32>,

    /// Maximum number of executions to return.
    pub limit: Option<usize>,

    /// Number of executions to skip.
    pub offset: Option<usize>,
}

impl ExecutionQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for executions in a specific status.
    pub fn for_status(status: ExecutionStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    /// Filters by a single status.
    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by multiple statuses (any of these).
    pub fn statuses(mut self, statuses: Vec<ExecutionStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Filters by workflow name.
    pub fn workflow_name(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self
    }

    /// Filters to executions started at or after this timestamp.
    pub fn started_after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.started_after = Some(timestamp);
        self
    }

    /// Filters to executions started at or before this timestamp.
    pub fn started_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.started_before = Some(timestamp);
        self
    }

    /// Filters to executions finished at or after this timestamp.
    pub fn finished_after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.finished_after = Some(timestamp);
        self
    }

    /// Filters to executions finished at or before this timestamp.
    pub fn finished_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.finished_before = Some(timestamp);
        self
    }

    /// Filters to executions whose deadline has passed at this timestamp.
    pub fn timeout_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timeout_before = Some(timestamp);
        self
    }

    /// Filters by retry classification.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Filters to executions with fewer than `max_attempts` attempts.
    pub fn attempts_below(mut self, max_attempts: u32) -> Self {
        self.attempts_below = Some(max_attempts);
        self
    }

    /// Limits the number of executions returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many executions before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_for_status() {
        let query = ExecutionQuery::for_status(ExecutionStatus::Running);

        assert_eq!(query.statuses, Some(vec![ExecutionStatus::Running]));
        assert!(query.workflow_name.is_none());
        assert!(query.limit.is_none());
    }

    #[test]
    fn query_builder_chain() {
        let now = Utc::now();
        let query = ExecutionQuery::new()
            .statuses(vec![ExecutionStatus::Compensated, ExecutionStatus::Failed])
            .workflow_name("place-order")
            .finished_after(now)
            .retryable(true)
            .attempts_below(3)
            .limit(50)
            .offset(10);

        assert_eq!(
            query.statuses,
            Some(vec![ExecutionStatus::Compensated, ExecutionStatus::Failed])
        );
        assert_eq!(query.workflow_name.as_deref(), Some("place-order"));
        assert_eq!(query.finished_after, Some(now));
        assert_eq!(query.retryable, Some(true));
        assert_eq!(query.attempts_below, Some(3));
        assert_eq!(query.limit, Some(50));
        assert_eq!(query.offset, Some(10));
    }
}
