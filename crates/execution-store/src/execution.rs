//! Workflow execution records and their status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExecutionId;
use crate::error::StoreError;

/// The status of a workflow execution.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           ├──► Failed ──┬──► Compensated ──► Running (retry)
///           │             └──► PartiallyCompensated
///           └──► TimedOut ──► Failed ──► ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Steps are being executed by the owning task.
    Running,

    /// Every step completed successfully (terminal state).
    Completed,

    /// A step failed. Compensation is pending, or could not be attempted
    /// because the owning process is gone.
    Failed,

    /// The deadline passed before the workflow finished.
    TimedOut,

    /// Failed and every registered compensation succeeded (terminal state).
    Compensated,

    /// Failed and at least one compensation failed (terminal state).
    PartiallyCompensated,
}

impl ExecutionStatus {
    /// Every status, in declaration order.
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::TimedOut,
        ExecutionStatus::Compensated,
        ExecutionStatus::PartiallyCompensated,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Compensated
                | ExecutionStatus::PartiallyCompensated
        )
    }

    /// Returns true if the execution ended, or is ending, because of a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Compensated
                | ExecutionStatus::PartiallyCompensated
        )
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (TimedOut, Failed)
                | (Failed, Compensated)
                | (Failed, PartiallyCompensated)
                | (Compensated, Running)
        )
    }

    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Compensated => "COMPENSATED",
            ExecutionStatus::PartiallyCompensated => "PARTIALLY_COMPENSATED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown execution status '{s}'")))
    }
}

/// One invocation of a named workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_name: String,
    /// Snapshot of the input the workflow was invoked with.
    pub input: serde_json::Value,
    /// Snapshot of the output, set once the execution completes.
    pub output: Option<serde_json::Value>,
    pub status: ExecutionStatus,
    pub correlation_id: String,
    /// Business key serializing this execution against others.
    pub lock_key: Option<String>,
    /// Token of the lock currently held for `lock_key`.
    pub lock_token: Option<String>,
    pub started_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Whether `last_error` was classified as transient.
    pub retryable: bool,
    /// Number of attempts made so far, starting at 1.
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Creates a new `Running` execution starting now.
    pub fn start(
        id: ExecutionId,
        workflow_name: impl Into<String>,
        input: serde_json::Value,
        correlation_id: impl Into<String>,
        timeout: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_name: workflow_name.into(),
            input,
            output: None,
            status: ExecutionStatus::Running,
            correlation_id: correlation_id.into(),
            lock_key: None,
            lock_token: None,
            started_at: now,
            timeout_at: now + timeout,
            finished_at: None,
            last_error: None,
            retryable: false,
            attempt_count: 1,
            updated_at: now,
        }
    }

    /// Records the lock held for this execution.
    pub fn with_lock(mut self, key: impl Into<String>, token: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self.lock_token = Some(token.into());
        self
    }

    /// Returns true if the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.timeout_at
    }

    /// Returns the timeout budget the execution was started with.
    pub fn timeout_budget(&self) -> chrono::Duration {
        self.timeout_at - self.started_at
    }

    /// Marks the execution completed with the given output snapshot.
    pub fn complete(&mut self, output: serde_json::Value) {
        let now = Utc::now();
        self.status = ExecutionStatus::Completed;
        self.output = Some(output);
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Marks the execution failed; compensation has not resolved yet.
    pub fn fail(&mut self, error: impl Into<String>, retryable: bool) {
        self.status = ExecutionStatus::Failed;
        self.last_error = Some(error.into());
        self.retryable = retryable;
        self.updated_at = Utc::now();
    }

    /// Marks the execution as past its deadline.
    pub fn time_out(&mut self) {
        self.status = ExecutionStatus::TimedOut;
        self.last_error = Some(format!("execution exceeded its deadline {}", self.timeout_at));
        self.updated_at = Utc::now();
    }

    /// Settles a failed execution once its unwind has finished.
    pub fn finish_compensation(&mut self, all_succeeded: bool) {
        let now = Utc::now();
        self.status = if all_succeeded {
            ExecutionStatus::Compensated
        } else {
            ExecutionStatus::PartiallyCompensated
        };
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Resets the execution for another attempt with the same input.
    ///
    /// The deadline is recomputed from the original timeout budget.
    pub fn begin_retry(&mut self) {
        let budget = self.timeout_budget();
        let now = Utc::now();
        self.status = ExecutionStatus::Running;
        self.attempt_count += 1;
        self.started_at = now;
        self.timeout_at = now + budget;
        self.finished_at = None;
        self.output = None;
        self.updated_at = now;
    }
}
