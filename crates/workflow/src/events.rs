//! Lifecycle notifications and the sinks that receive them.
//!
//! Publishing is fire-and-forget: the engine calls [`EventSink::publish`]
//! synchronously and only logs a returned error.

use std::sync::{Arc, Mutex, PoisonError};

use common::ExecutionId;
use execution_store::ExecutionStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Notifications emitted while an execution runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow: String,
        attempt: u32,
    },
    StepStarted {
        execution_id: ExecutionId,
        step: String,
        step_index: u32,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step: String,
        step_index: u32,
        duration_ms: i64,
    },
    StepFailed {
        execution_id: ExecutionId,
        step: String,
        step_index: u32,
        error: String,
    },
    CompensationCompleted {
        execution_id: ExecutionId,
        step: String,
        step_index: u32,
    },
    CompensationFailed {
        execution_id: ExecutionId,
        step: String,
        step_index: u32,
        error: String,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        workflow: String,
        status: ExecutionStatus,
        duration_ms: i64,
    },
}

impl WorkflowEvent {
    /// Returns the execution this event belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::CompensationCompleted { execution_id, .. }
            | WorkflowEvent::CompensationFailed { execution_id, .. }
            | WorkflowEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }

    /// Returns a short name for the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::ExecutionStarted { .. } => "ExecutionStarted",
            WorkflowEvent::StepStarted { .. } => "StepStarted",
            WorkflowEvent::StepCompleted { .. } => "StepCompleted",
            WorkflowEvent::StepFailed { .. } => "StepFailed",
            WorkflowEvent::CompensationCompleted { .. } => "CompensationCompleted",
            WorkflowEvent::CompensationFailed { .. } => "CompensationFailed",
            WorkflowEvent::ExecutionFinished { .. } => "ExecutionFinished",
        }
    }
}

/// Errors a sink may report. The engine never propagates them.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No subscribers")]
    NoSubscribers,

    #[error("Sink error: {0}")]
    Other(String),
}

/// Receiver of workflow lifecycle notifications.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Must not block.
    fn publish(&self, event: &WorkflowEvent) -> Result<(), SinkError>;
}

/// Publishes `event`, logging and dropping any sink error.
pub(crate) fn emit(sink: &dyn EventSink, event: WorkflowEvent) {
    if let Err(e) = sink.publish(&event) {
        tracing::debug!(error = %e, event_type = event.event_type(), "event sink rejected event");
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: &WorkflowEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Records events as `metrics` counters and histograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn publish(&self, event: &WorkflowEvent) -> Result<(), SinkError> {
        match event {
            WorkflowEvent::ExecutionStarted { workflow, .. } => {
                metrics::counter!("workflow_executions_total", "workflow" => workflow.clone())
                    .increment(1);
            }
            WorkflowEvent::StepStarted { step, .. } => {
                metrics::counter!("workflow_steps_total", "step" => step.clone()).increment(1);
            }
            WorkflowEvent::StepCompleted {
                step, duration_ms, ..
            } => {
                metrics::histogram!("workflow_step_duration_seconds", "step" => step.clone())
                    .record(*duration_ms as f64 / 1000.0);
            }
            WorkflowEvent::StepFailed { step, .. } => {
                metrics::counter!("workflow_step_failures_total", "step" => step.clone())
                    .increment(1);
            }
            WorkflowEvent::CompensationCompleted { step, .. } => {
                metrics::counter!("workflow_compensations_total", "step" => step.clone())
                    .increment(1);
            }
            WorkflowEvent::CompensationFailed { step, .. } => {
                metrics::counter!("workflow_compensation_failures_total", "step" => step.clone())
                    .increment(1);
            }
            WorkflowEvent::ExecutionFinished {
                workflow,
                status,
                duration_ms,
                ..
            } => {
                if *status == ExecutionStatus::Completed {
                    metrics::counter!("workflow_executions_completed", "workflow" => workflow.clone())
                        .increment(1);
                } else {
                    metrics::counter!(
                        "workflow_executions_failed",
                        "workflow" => workflow.clone(),
                        "status" => status.as_str()
                    )
                    .increment(1);
                }
                metrics::histogram!("workflow_execution_duration_seconds", "workflow" => workflow.clone())
                    .record(*duration_ms as f64 / 1000.0);
            }
        }
        Ok(())
    }
}

/// Fans events out to subscribers over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastSink {
    /// Creates a sink whose channel buffers `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events (returns a receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &WorkflowEvent) -> Result<(), SinkError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| SinkError::NoSubscribers)
    }
}

/// Keeps every event in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the recorded events for one execution.
    pub fn events_for(&self, execution_id: ExecutionId) -> Vec<WorkflowEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.execution_id() == execution_id)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for InMemorySink {
    fn publish(&self, event: &WorkflowEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Delivers each event to several sinks.
///
/// Every sink sees every event; the first error is reported after all of
/// them have been called.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &WorkflowEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event)
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: ExecutionId) -> WorkflowEvent {
        WorkflowEvent::ExecutionStarted {
            execution_id: id,
            workflow: "order-placement".to_string(),
            attempt: 1,
        }
    }

    #[test]
    fn in_memory_sink_records_and_filters() {
        let sink = InMemorySink::new();
        let a = ExecutionId::new();
        let b = ExecutionId::new();

        sink.publish(&started(a)).unwrap();
        sink.publish(&started(b)).unwrap();

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.events_for(a), vec![started(a)]);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let id = ExecutionId::new();

        // No receivers yet
        assert!(matches!(
            sink.publish(&started(id)),
            Err(SinkError::NoSubscribers)
        ));

        let mut rx = sink.subscribe();
        sink.publish(&started(id)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), started(id));
    }

    #[test]
    fn fanout_reaches_every_sink_despite_errors() {
        let recorder = InMemorySink::new();
        let fanout = FanoutSink::new(vec![Arc::new(BroadcastSink::new(4))])
            .with(Arc::new(recorder.clone()))
            .with(Arc::new(MetricsSink));

        let result = fanout.publish(&started(ExecutionId::new()));

        assert!(result.is_err());
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(started(ExecutionId::new())).unwrap();
        assert_eq!(json["type"], "ExecutionStarted");
        assert_eq!(json["workflow"], "order-placement");
    }
}
