//! Background recovery: timeout detection, retries, stale-step alerts and
//! retention cleanup.
//!
//! Each sweep is a public async method that can be driven directly.
//! [`Maintenance::spawn`] runs all four on their own tokio tasks.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use common::{ExecutionId, exponential_backoff};
use execution_store::{ExecutionQuery, ExecutionStatus, WorkflowExecution};
use locks::LockToken;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MaintenanceConfig;
use crate::engine::WorkflowEngine;
use crate::error::Result;

const ORPHANED_ERROR: &str = "execution timed out with no live owner; compensation not possible";

/// Outcome of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutSweepReport {
    pub expired: usize,
    /// Owner runs in this process and was told to unwind.
    pub signalled: usize,
    /// No live owner; marked `FAILED` for operator follow-up.
    pub orphaned: Vec<ExecutionId>,
    pub errors: usize,
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepReport {
    pub candidates: usize,
    /// Still inside their backoff window.
    pub deferred: usize,
    pub succeeded: Vec<ExecutionId>,
    pub failed: Vec<ExecutionId>,
    pub errors: usize,
}

/// A step that started but never finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleStep {
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub step_name: String,
    pub step_index: u32,
    pub started_at: DateTime<Utc>,
}

/// Outcome of one stale-step sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleStepReport {
    pub stale: Vec<StaleStep>,
}

/// Outcome of one retention cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub deleted: u64,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Time from `now` until the next wall-clock occurrence of `at` (UTC).
pub fn duration_until_next(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Periodic recovery tasks over an engine's execution store.
#[derive(Debug, Clone)]
pub struct Maintenance {
    engine: WorkflowEngine,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(engine: WorkflowEngine, config: MaintenanceConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Moves `RUNNING` executions past their deadline to `TIMED_OUT`.
    ///
    /// A locally running owner is signalled and unwinds at its next step
    /// boundary. An execution with no owner here cannot be compensated: it is
    /// marked `FAILED` and its lock released.
    #[tracing::instrument(skip(self))]
    pub async fn timeout_sweep(&self) -> Result<TimeoutSweepReport> {
        let store = self.engine.store();
        let expired = store
            .find_executions(
                ExecutionQuery::for_status(ExecutionStatus::Running).timeout_before(Utc::now()),
            )
            .await?;

        let mut report = TimeoutSweepReport {
            expired: expired.len(),
            ..Default::default()
        };

        for execution in expired {
            let mut timed_out = execution.clone();
            timed_out.time_out();

            match store
                .update_execution_if(&timed_out, ExecutionStatus::Running)
                .await
            {
                Ok(true) => {}
                // The owner settled it first
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(execution_id = %execution.id, error = %e, "failed to time out execution");
                    report.errors += 1;
                    continue;
                }
            }
            metrics::counter!("workflow_maintenance_timeouts_total").increment(1);

            if self.engine.signal_timeout(execution.id) {
                tracing::info!(execution_id = %execution.id, "timed out execution signalled to unwind");
                report.signalled += 1;
                continue;
            }

            match self.fail_orphan(timed_out).await {
                Ok(true) => report.orphaned.push(execution.id),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(execution_id = %execution.id, error = %e, "failed to settle orphaned execution");
                    report.errors += 1;
                }
            }
        }

        if report.expired > 0 {
            tracing::info!(
                expired = report.expired,
                signalled = report.signalled,
                orphaned = report.orphaned.len(),
                "timeout sweep finished"
            );
        }
        Ok(report)
    }

    async fn fail_orphan(&self, mut execution: WorkflowExecution) -> Result<bool> {
        execution.fail(ORPHANED_ERROR, false);
        if !self
            .engine
            .store()
            .update_execution_if(&execution, ExecutionStatus::TimedOut)
            .await?
        {
            // An owner elsewhere picked it up
            return Ok(false);
        }

        if let (Some(key), Some(token)) = (&execution.lock_key, &execution.lock_token) {
            let token = LockToken::from_string(token.clone());
            if !self.engine.locks().release(key, &token).await? {
                tracing::debug!(lock_key = %key, "orphaned execution's lock had already expired");
            }
        }

        metrics::counter!("workflow_maintenance_orphans_total").increment(1);
        tracing::warn!(
            execution_id = %execution.id,
            workflow = %execution.workflow_name,
            correlation_id = %execution.correlation_id,
            lock_key = execution.lock_key.as_deref().unwrap_or(""),
            "orphaned execution marked FAILED without compensation, manual follow-up required"
        );
        Ok(true)
    }

    /// Re-runs compensated executions whose failure was transient.
    ///
    /// Candidates finished within the lookback window, are below the attempt
    /// cap, and have waited out their backoff since finishing. Each is re-run
    /// from its first step under the same id.
    #[tracing::instrument(skip(self))]
    pub async fn retry_sweep(&self) -> Result<RetrySweepReport> {
        let now = Utc::now();
        let candidates = self
            .engine
            .store()
            .find_executions(
                ExecutionQuery::for_status(ExecutionStatus::Compensated)
                    .finished_after(now - to_chrono(self.config.retry_lookback))
                    .retryable(true)
                    .attempts_below(self.config.max_attempts),
            )
            .await?;

        let mut report = RetrySweepReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for execution in candidates {
            if !self.backoff_elapsed(&execution, now) {
                report.deferred += 1;
                continue;
            }

            match self.engine.retry_execution(execution.id).await {
                Ok(_) => {
                    metrics::counter!("workflow_maintenance_retries_succeeded_total").increment(1);
                    report.succeeded.push(execution.id);
                }
                Err(e) if e.final_status().is_some() => {
                    metrics::counter!("workflow_maintenance_retries_failed_total").increment(1);
                    tracing::warn!(execution_id = %execution.id, error = %e, "retry attempt failed");
                    report.failed.push(execution.id);
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution.id, error = %e, "retry could not start");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    fn backoff_elapsed(&self, execution: &WorkflowExecution, now: DateTime<Utc>) -> bool {
        let Some(finished_at) = execution.finished_at else {
            return false;
        };
        let delay = exponential_backoff(
            execution.attempt_count,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
        );
        finished_at + to_chrono(delay) <= now
    }

    /// Reports steps that started longer ago than the threshold and never
    /// finished. Alerts only; nothing is changed.
    #[tracing::instrument(skip(self))]
    pub async fn stale_step_sweep(&self) -> Result<StaleStepReport> {
        let threshold = Utc::now() - to_chrono(self.config.stale_step_threshold);
        let events = self.engine.store().find_stale_steps(threshold).await?;

        let stale: Vec<StaleStep> = events
            .into_iter()
            .map(|event| StaleStep {
                execution_id: event.execution_id,
                attempt: event.attempt,
                step_name: event.step_name,
                step_index: event.step_index,
                started_at: event.started_at,
            })
            .collect();

        for step in &stale {
            tracing::warn!(
                execution_id = %step.execution_id,
                step = %step.step_name,
                step_index = step.step_index,
                started_at = %step.started_at,
                "stale step detected"
            );
        }
        metrics::gauge!("workflow_maintenance_stale_steps").set(stale.len() as f64);

        Ok(StaleStepReport { stale })
    }

    /// Deletes terminal executions, and their step history, that finished
    /// before the retention window.
    #[tracing::instrument(skip(self))]
    pub async fn retention_cleanup(&self) -> Result<CleanupReport> {
        let cutoff = Utc::now() - to_chrono(self.config.retention);
        let deleted = self.engine.store().delete_finished_before(cutoff).await?;

        metrics::counter!("workflow_maintenance_deleted_total").increment(deleted);
        tracing::info!(deleted, %cutoff, "retention cleanup finished");
        Ok(CleanupReport {
            cutoff: Some(cutoff),
            deleted,
        })
    }

    /// Starts the four sweeps on their own tasks.
    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown, rx) = watch::channel(false);
        let config = self.config.clone();

        let tasks = vec![
            spawn_periodic("timeout", config.timeout_sweep_interval, rx.clone(), {
                let this = self.clone();
                move || {
                    let this = this.clone();
                    async move { this.timeout_sweep().await.map(|_| ()) }
                }
            }),
            spawn_periodic("retry", config.retry_sweep_interval, rx.clone(), {
                let this = self.clone();
                move || {
                    let this = this.clone();
                    async move { this.retry_sweep().await.map(|_| ()) }
                }
            }),
            spawn_periodic("stale_step", config.stale_sweep_interval, rx.clone(), {
                let this = self.clone();
                move || {
                    let this = this.clone();
                    async move { this.stale_step_sweep().await.map(|_| ()) }
                }
            }),
            spawn_daily_cleanup(self, config.cleanup_time, rx),
        ];

        tracing::info!("maintenance tasks started");
        MaintenanceHandle { shutdown, tasks }
    }
}

/// Runs one sweep on its own task so a panic only loses that tick.
async fn run_isolated<F, Fut>(name: &'static str, sweep: &F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(sweep()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics::counter!("workflow_maintenance_errors_total", "sweep" => name).increment(1);
            tracing::error!(sweep = name, error = %e, "maintenance sweep failed");
        }
        Err(e) => {
            metrics::counter!("workflow_maintenance_errors_total", "sweep" => name).increment(1);
            tracing::error!(sweep = name, error = %e, "maintenance sweep panicked");
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => run_isolated(name, &sweep).await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(sweep = name, "maintenance task stopped");
    })
}

fn spawn_daily_cleanup(
    maintenance: Maintenance,
    at: NaiveTime,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let sweep = move || {
        let this = maintenance.clone();
        async move { this.retention_cleanup().await.map(|_| ()) }
    };
    tokio::spawn(async move {
        loop {
            let wait = duration_until_next(Utc::now(), at);
            tokio::select! {
                _ = tokio::time::sleep(wait) => run_isolated("retention", &sweep).await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(sweep = "retention", "maintenance task stopped");
    })
}

/// Handle to the running maintenance tasks. Dropping it also stops them.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stops every task and waits for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "maintenance task ended abnormally");
            }
        }
        tracing::info!("maintenance tasks stopped");
    }
}
