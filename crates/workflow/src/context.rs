//! Per-execution context handed to workflow bodies and steps.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use common::ExecutionId;
use execution_store::{ExecutionStore, WorkflowExecution, WorkflowStepEvent};
use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::Mutex;

use crate::compensation::{CompensationEntry, CompensationStack, StepCompensation};
use crate::error::{Result, WorkflowError};
use crate::events::{EventSink, WorkflowEvent, emit};
use crate::step::{Step, StepError};

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// Why an execution was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Cooperative stop flag shared between an execution and whoever may
/// interrupt it. The first interrupt wins.
#[derive(Debug, Default)]
pub(crate) struct InterruptSignal(AtomicU8);

impl InterruptSignal {
    pub(crate) fn cancel(&self) -> bool {
        self.set(CANCELLED)
    }

    pub(crate) fn time_out(&self) -> bool {
        self.set(TIMED_OUT)
    }

    pub(crate) fn get(&self) -> Option<Interrupt> {
        match self.0.load(Ordering::Acquire) {
            CANCELLED => Some(Interrupt::Cancelled),
            TIMED_OUT => Some(Interrupt::TimedOut),
            _ => None,
        }
    }

    fn set(&self, state: u8) -> bool {
        self.0
            .compare_exchange(RUNNING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// State for one attempt of one execution.
///
/// Hands out step indices, records step transitions, and keeps the
/// compensation stack the engine unwinds on failure.
pub struct WorkflowContext {
    execution_id: ExecutionId,
    workflow_name: String,
    correlation_id: String,
    attempt: u32,
    timeout_at: DateTime<Utc>,
    next_index: AtomicU32,
    compensations: Mutex<CompensationStack>,
    signal: Arc<InterruptSignal>,
    store: Arc<dyn ExecutionStore>,
    sink: Arc<dyn EventSink>,
    parallel_limit: usize,
}

impl WorkflowContext {
    pub(crate) fn new(
        execution: &WorkflowExecution,
        signal: Arc<InterruptSignal>,
        store: Arc<dyn ExecutionStore>,
        sink: Arc<dyn EventSink>,
        parallel_limit: usize,
    ) -> Self {
        Self {
            execution_id: execution.id,
            workflow_name: execution.workflow_name.clone(),
            correlation_id: execution.correlation_id.clone(),
            attempt: execution.attempt_count,
            timeout_at: execution.timeout_at,
            next_index: AtomicU32::new(0),
            compensations: Mutex::new(CompensationStack::new()),
            signal,
            store,
            sink,
            parallel_limit,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 1 for the first run, incremented on every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn timeout_at(&self) -> DateTime<Utc> {
        self.timeout_at
    }

    /// Largest group [`parallel`](Self::parallel) accepts.
    pub fn parallel_limit(&self) -> usize {
        self.parallel_limit
    }

    /// Number of steps dispatched so far in this attempt.
    pub fn steps_started(&self) -> u32 {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Number of compensations waiting to run if the execution fails.
    pub async fn pending_compensations(&self) -> usize {
        self.compensations.lock().await.len()
    }

    /// Returns an error if the execution was cancelled or ran out of time.
    ///
    /// Checked before every step; running steps are never preempted.
    pub fn check_interrupted(&self) -> Result<()> {
        match self.signal.get() {
            Some(Interrupt::Cancelled) => Err(WorkflowError::Cancelled(self.execution_id)),
            Some(Interrupt::TimedOut) => Err(WorkflowError::TimeoutExceeded(self.execution_id)),
            None if Utc::now() >= self.timeout_at => {
                Err(WorkflowError::TimeoutExceeded(self.execution_id))
            }
            None => Ok(()),
        }
    }

    /// Runs one step, recording its transitions and registering its
    /// compensation on success.
    ///
    /// The step index is taken before the first await, so steps dispatched
    /// together through [`parallel`](Self::parallel) are numbered in
    /// submission order.
    #[tracing::instrument(
        skip_all,
        fields(execution_id = %self.execution_id, step = step.name())
    )]
    pub async fn run_step<S: Step>(&self, step: &Arc<S>, input: S::Input) -> Result<S::Output> {
        self.check_interrupted()?;
        let step_index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let step_name = step.name().to_string();

        let started = WorkflowStepEvent::started(
            self.execution_id,
            self.attempt,
            &step_name,
            step_index,
            serde_json::to_value(&input)?,
        );
        self.store.append_step_event(&started).await?;
        emit(
            self.sink.as_ref(),
            WorkflowEvent::StepStarted {
                execution_id: self.execution_id,
                step: step_name.clone(),
                step_index,
            },
        );
        tracing::debug!(step_index, "step started");

        match step.execute(&input, self).await {
            Ok(output) => {
                let snapshot = serde_json::to_value(&output.value);
                // Register before persisting so a store failure still unwinds the side effect
                if step.compensates() {
                    self.compensations.lock().await.push(CompensationEntry {
                        step_name: step_name.clone(),
                        step_index,
                        action: Box::new(StepCompensation::new(
                            Arc::clone(step),
                            input,
                            output.value.clone(),
                            output.compensation_data,
                        )),
                    });
                }

                let completed = started.completed(snapshot?);
                self.store.append_step_event(&completed).await?;
                let duration_ms = completed.duration_ms.unwrap_or_default();
                emit(
                    self.sink.as_ref(),
                    WorkflowEvent::StepCompleted {
                        execution_id: self.execution_id,
                        step: step_name,
                        step_index,
                        duration_ms,
                    },
                );
                tracing::info!(step_index, duration_ms, "step completed");
                Ok(output.value)
            }
            Err(error) => {
                let failed = started.failed(error.to_string());
                if let Err(e) = self.store.append_step_event(&failed).await {
                    tracing::error!(step_index, error = %e, "failed to record step failure");
                }
                emit(
                    self.sink.as_ref(),
                    WorkflowEvent::StepFailed {
                        execution_id: self.execution_id,
                        step: step_name.clone(),
                        step_index,
                        error: error.to_string(),
                    },
                );
                tracing::warn!(step_index, error = %error, retryable = error.retryable, "step failed");
                Err(WorkflowError::StepExecutionFailed {
                    step: step_name,
                    source: error,
                })
            }
        }
    }

    /// Runs a fixed group of operations concurrently on the current task and
    /// waits for all of them.
    ///
    /// Results come back in submission order. If any operation fails, the
    /// first error in submission order is returned once every sibling has
    /// finished; siblings are not cancelled and their compensations stay
    /// registered. Use this only for read-only or independent operations.
    pub async fn parallel<T, F>(&self, operations: Vec<F>) -> Result<Vec<T>>
    where
        F: Future<Output = Result<T>>,
    {
        if operations.len() > self.parallel_limit {
            return Err(WorkflowError::ParallelGroupTooLarge {
                size: operations.len(),
                limit: self.parallel_limit,
            });
        }

        join_all(operations).await.into_iter().collect()
    }

    /// Pops and runs every registered compensation, most recent first.
    ///
    /// A failing or panicking compensation is logged and collected; it never
    /// stops the remaining ones.
    pub(crate) async fn unwind(&self) -> Vec<WorkflowError> {
        let mut failures = Vec::new();

        loop {
            let entry = self.compensations.lock().await.pop();
            let Some(entry) = entry else {
                break;
            };

            let outcome = AssertUnwindSafe(entry.action.compensate(self))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(StepError::permanent("compensation panicked")));

            match outcome {
                Ok(()) => {
                    tracing::info!(
                        execution_id = %self.execution_id,
                        step = %entry.step_name,
                        step_index = entry.step_index,
                        "compensation completed"
                    );
                    emit(
                        self.sink.as_ref(),
                        WorkflowEvent::CompensationCompleted {
                            execution_id: self.execution_id,
                            step: entry.step_name,
                            step_index: entry.step_index,
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        step = %entry.step_name,
                        step_index = entry.step_index,
                        error = %error,
                        "compensation failed"
                    );
                    emit(
                        self.sink.as_ref(),
                        WorkflowEvent::CompensationFailed {
                            execution_id: self.execution_id,
                            step: entry.step_name.clone(),
                            step_index: entry.step_index,
                            error: error.to_string(),
                        },
                    );
                    failures.push(WorkflowError::CompensationFailed {
                        step: entry.step_name,
                        step_index: entry.step_index,
                        source: error,
                    });
                }
            }
        }

        failures
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("execution_id", &self.execution_id)
            .field("workflow_name", &self.workflow_name)
            .field("attempt", &self.attempt)
            .field("timeout_at", &self.timeout_at)
            .finish_non_exhaustive()
    }
}
