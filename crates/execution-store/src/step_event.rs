//! Step transition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ExecutionId;
use crate::error::StoreError;

/// Unique identifier for a step event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepEventId(Uuid);

impl StepEventId {
    /// Creates a new random step event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a step event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StepEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which transition a step event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "STARTED",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepStatus::Started)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(StepStatus::Started),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            other => Err(StoreError::InvalidData(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}

/// One step transition within one execution attempt.
///
/// Events are append-only. A step writes a `Started` event when it is
/// dispatched and a `Completed` or `Failed` event with the same
/// `(execution_id, attempt, step_index)` when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepEvent {
    pub id: StepEventId,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub step_name: String,
    /// Position of the step in dispatch order, starting at 0 per attempt.
    pub step_index: u32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl WorkflowStepEvent {
    /// Creates a `Started` event.
    pub fn started(
        execution_id: ExecutionId,
        attempt: u32,
        step_name: impl Into<String>,
        step_index: u32,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: StepEventId::new(),
            execution_id,
            attempt,
            step_name: step_name.into(),
            step_index,
            status: StepStatus::Started,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            input: Some(input),
            output: None,
            error: None,
            recorded_at: now,
        }
    }

    /// Creates the `Completed` event matching this `Started` event.
    pub fn completed(&self, output: serde_json::Value) -> Self {
        self.finish(StepStatus::Completed, Some(output), None)
    }

    /// Creates the `Failed` event matching this `Started` event.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        self.finish(StepStatus::Failed, None, Some(error.into()))
    }

    fn finish(
        &self,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: StepEventId::new(),
            execution_id: self.execution_id,
            attempt: self.attempt,
            step_name: self.step_name.clone(),
            step_index: self.step_index,
            status,
            started_at: self.started_at,
            finished_at: Some(now),
            duration_ms: Some((now - self.started_at).num_milliseconds()),
            input: None,
            output,
            error,
            recorded_at: now,
        }
    }

    /// Returns true if `other` records the same step dispatch.
    pub fn same_step(&self, other: &WorkflowStepEvent) -> bool {
        self.execution_id == other.execution_id
            && self.attempt == other.attempt
            && self.step_index == other.step_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_event_matches_started() {
        let started = WorkflowStepEvent::started(
            ExecutionId::new(),
            1,
            "reserve-inventory",
            0,
            serde_json::json!({"sku": "SKU-1"}),
        );
        let completed = started.completed(serde_json::json!({"reservation_id": "RES-0001"}));

        assert_eq!(completed.status, StepStatus::Completed);
        assert!(completed.same_step(&started));
        assert_ne!(completed.id, started.id);
        assert_eq!(completed.started_at, started.started_at);
        assert!(completed.duration_ms.unwrap() >= 0);
        assert!(completed.error.is_none());
    }

    #[test]
    fn failed_event_carries_error() {
        let started =
            WorkflowStepEvent::started(ExecutionId::new(), 2, "authorize-payment", 1, serde_json::json!({}));
        let failed = started.failed("card declined");

        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.attempt, 2);
        assert_eq!(failed.error.as_deref(), Some("card declined"));
        assert!(failed.output.is_none());
    }

    #[test]
    fn step_status_parsing() {
        assert_eq!("STARTED".parse::<StepStatus>().unwrap(), StepStatus::Started);
        assert!(StepStatus::Failed.is_finished());
        assert!(!StepStatus::Started.is_finished());
        assert!("RUNNING".parse::<StepStatus>().is_err());
    }
}
