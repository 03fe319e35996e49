//! Workflow engine: runs registered workflows under locks, records their
//! executions, and unwinds them on failure.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use common::ExecutionId;
use execution_store::{
    ExecutionQuery, ExecutionStatus, ExecutionStore, ExecutionStoreExt, WorkflowExecution,
    WorkflowStepEvent,
};
use locks::{LockProvider, LockProviderExt, LockToken};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::{InterruptSignal, WorkflowContext};
use crate::error::{Result, WorkflowError};
use crate::events::{EventSink, MetricsSink, WorkflowEvent, emit};
use crate::health::HealthReport;
use crate::options::ExecuteOptions;
use crate::registry::{Workflow, WorkflowDefinition, WorkflowInfo, WorkflowRegistry};

const COMPLETION_WRITE_ATTEMPTS: u32 = 3;
const COMPLETION_WRITE_DELAY: Duration = Duration::from_millis(50);

const FAILURE_STATUSES: [ExecutionStatus; 4] = [
    ExecutionStatus::Failed,
    ExecutionStatus::TimedOut,
    ExecutionStatus::Compensated,
    ExecutionStatus::PartiallyCompensated,
];

type ActiveMap = RwLock<HashMap<ExecutionId, Arc<InterruptSignal>>>;

struct EngineInner {
    registry: WorkflowRegistry,
    store: Arc<dyn ExecutionStore>,
    locks: Arc<dyn LockProvider>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    active: ActiveMap,
}

/// Runs registered workflows.
///
/// Cheap to clone; clones share the registry, the backends, and the set of
/// executions running in this process.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Creates an engine that reports lifecycle events as metrics.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        locks: Arc<dyn LockProvider>,
        config: EngineConfig,
    ) -> Self {
        Self::with_sink(store, locks, Arc::new(MetricsSink), config)
    }

    /// Creates an engine publishing lifecycle events to `sink`.
    pub fn with_sink(
        store: Arc<dyn ExecutionStore>,
        locks: Arc<dyn LockProvider>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: WorkflowRegistry::new(),
                store,
                locks,
                sink,
                config,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registers a workflow under a unique name.
    pub fn register<W: Workflow>(&self, name: impl Into<String>, workflow: W) -> Result<()> {
        self.inner.registry.register(name, workflow)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowInfo> {
        self.inner.registry.list()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn locks(&self) -> &Arc<dyn LockProvider> {
        &self.inner.locks
    }

    /// Executes a workflow with typed input and output.
    ///
    /// `I` and `O` must be the registered input and output types.
    #[tracing::instrument(skip(self, input, options))]
    pub async fn execute<I, O>(&self, name: &str, input: I, options: ExecuteOptions) -> Result<O>
    where
        I: Serialize + Send + 'static,
        O: DeserializeOwned + 'static,
    {
        let definition = self.inner.registry.get(name)?;
        definition.check_input_type::<I>()?;
        definition.check_output_type::<O>()?;

        let input = serde_json::to_value(input)?;
        let output = self.start(&definition, input, options).await?;
        Ok(serde_json::from_value(output)?)
    }

    /// Executes a workflow with JSON input, validated against the registered
    /// input shape.
    #[tracing::instrument(skip(self, input, options))]
    pub async fn execute_json(
        &self,
        name: &str,
        input: serde_json::Value,
        options: ExecuteOptions,
    ) -> Result<serde_json::Value> {
        let definition = self.inner.registry.get(name)?;
        definition.check_input_json(&input)?;
        self.start(&definition, input, options).await
    }

    /// Re-runs a compensated execution from its first step, under the same id.
    #[tracing::instrument(skip(self))]
    pub async fn retry_execution(&self, execution_id: ExecutionId) -> Result<serde_json::Value> {
        let execution = self.inner.store.require_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Compensated {
            return Err(WorkflowError::NotRetryable {
                execution_id,
                status: execution.status,
            });
        }
        let definition = self.inner.registry.get(&execution.workflow_name)?;

        let lease = match execution.lock_key.clone() {
            Some(key) => Some(self.acquire_lease(key).await?),
            None => None,
        };

        let mut retry = execution.clone();
        retry.begin_retry();
        retry.lock_token = lease.as_ref().map(|lease| lease.token.as_str().to_string());

        let claimed = self
            .inner
            .store
            .update_execution_if(&retry, ExecutionStatus::Compensated)
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                release(lease).await;
                let status = self
                    .inner
                    .store
                    .get_execution(execution_id)
                    .await
                    .ok()
                    .flatten()
                    .map_or(execution.status, |current| current.status);
                return Err(WorkflowError::NotRetryable {
                    execution_id,
                    status,
                });
            }
            Err(e) => {
                release(lease).await;
                return Err(e.into());
            }
        }

        metrics::counter!("workflow_retries_total", "workflow" => retry.workflow_name.clone())
            .increment(1);
        tracing::info!(
            workflow = %retry.workflow_name,
            attempt = retry.attempt_count,
            "retrying execution"
        );

        let input = retry.input.clone();
        self.drive(&definition, retry, input, lease).await
    }

    /// Requests cooperative cancellation of an execution running in this
    /// process. It stops before its next step and unwinds.
    ///
    /// Returns false if the execution is not running here or was already
    /// interrupted.
    pub fn cancel(&self, execution_id: ExecutionId) -> bool {
        self.active_signal(execution_id)
            .is_some_and(|signal| signal.cancel())
    }

    /// Returns true if the execution is being driven by this process.
    pub fn is_running_here(&self, execution_id: ExecutionId) -> bool {
        self.active_signal(execution_id).is_some()
    }

    /// Number of executions being driven by this process.
    pub fn active_executions(&self) -> usize {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        Ok(self.inner.store.get_execution(execution_id).await?)
    }

    /// Recorded step transitions of an execution, all attempts included.
    pub async fn step_history(&self, execution_id: ExecutionId) -> Result<Vec<WorkflowStepEvent>> {
        Ok(self.inner.store.get_step_events(execution_id).await?)
    }

    /// True if at least one workflow is registered and the store is reachable.
    pub async fn is_healthy(&self) -> bool {
        !self.inner.registry.is_empty() && self.inner.store.ping().await.is_ok()
    }

    /// Health snapshot counting failures started within `lookback`.
    pub async fn health_report(&self, lookback: Duration) -> HealthReport {
        let workflow_names: Vec<String> = self
            .inner
            .registry
            .list()
            .into_iter()
            .map(|info| info.name)
            .collect();

        let store_reachable = match self.inner.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "execution store unreachable");
                false
            }
        };

        let mut recent_failures = 0;
        if store_reachable {
            let since = Utc::now()
                - chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::days(1));
            let query = ExecutionQuery::new()
                .statuses(FAILURE_STATUSES.to_vec())
                .started_after(since);
            match self.inner.store.count_executions(query).await {
                Ok(count) => recent_failures = count,
                Err(e) => tracing::warn!(error = %e, "failed to count recent failures"),
            }
        }

        HealthReport {
            healthy: store_reachable && !workflow_names.is_empty(),
            store_reachable,
            registered_workflows: workflow_names.len(),
            workflow_names,
            recent_failures,
        }
    }

    /// Interrupts a locally running execution because its deadline passed.
    ///
    /// Returns true whenever the execution has a live owner here, even if an
    /// earlier cancel already claimed the signal. That owner still unwinds
    /// and releases its own lock.
    pub(crate) fn signal_timeout(&self, execution_id: ExecutionId) -> bool {
        self.active_signal(execution_id)
            .map(|signal| {
                if !signal.time_out() {
                    tracing::debug!(%execution_id, "execution already interrupted");
                }
            })
            .is_some()
    }

    fn active_signal(&self, execution_id: ExecutionId) -> Option<Arc<InterruptSignal>> {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .cloned()
    }

    async fn start(
        &self,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
        options: ExecuteOptions,
    ) -> Result<serde_json::Value> {
        let execution_id = options.execution_id.unwrap_or_default();
        let timeout = options.timeout.unwrap_or(self.inner.config.default_timeout);
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| execution_id.to_string());

        let lease = match options.lock_key {
            Some(key) => Some(self.acquire_lease(key).await?),
            None => None,
        };

        let mut execution = WorkflowExecution::start(
            execution_id,
            definition.name(),
            input.clone(),
            correlation_id,
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365)),
        );
        if let Some(lease) = &lease {
            execution = execution.with_lock(&lease.key, lease.token.as_str());
        }

        if let Err(e) = self.inner.store.insert_execution(&execution).await {
            release(lease).await;
            return Err(e.into());
        }

        self.drive(definition, execution, input, lease).await
    }

    /// Runs the workflow body for a persisted `Running` execution and settles
    /// the outcome.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        mut execution: WorkflowExecution,
        input: serde_json::Value,
        lease: Option<LockLease>,
    ) -> Result<serde_json::Value> {
        let signal = Arc::new(InterruptSignal::default());
        let _active = ActiveGuard::register(&self.inner.active, execution.id, Arc::clone(&signal));
        let renewal = lease
            .as_ref()
            .and_then(|lease| self.spawn_renewal(lease, execution.timeout_budget()));

        let ctx = WorkflowContext::new(
            &execution,
            signal,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.sink),
            self.inner.config.parallel_group_limit,
        );
        let started = Instant::now();

        emit(
            self.inner.sink.as_ref(),
            WorkflowEvent::ExecutionStarted {
                execution_id: execution.id,
                workflow: execution.workflow_name.clone(),
                attempt: execution.attempt_count,
            },
        );
        tracing::info!(
            execution_id = %execution.id,
            workflow = %execution.workflow_name,
            correlation_id = %execution.correlation_id,
            attempt = execution.attempt_count,
            "execution started"
        );

        let result = match definition.run(input, &ctx).await {
            Ok(output) => self.complete(&ctx, &mut execution, output).await,
            Err(cause) => Err(self.fail(&ctx, &mut execution, cause).await),
        };

        drop(renewal);
        release(lease).await;

        emit(
            self.inner.sink.as_ref(),
            WorkflowEvent::ExecutionFinished {
                execution_id: execution.id,
                workflow: execution.workflow_name.clone(),
                status: execution.status,
                duration_ms: started.elapsed().as_millis() as i64,
            },
        );
        result
    }

    async fn complete(
        &self,
        ctx: &WorkflowContext,
        execution: &mut WorkflowExecution,
        output: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut completed = execution.clone();
        completed.complete(output.clone());

        match self.record_completion(&completed).await {
            Ok(true) => {
                *execution = completed;
                tracing::info!(
                    execution_id = %execution.id,
                    steps = ctx.steps_started(),
                    "execution completed"
                );
                return Ok(output);
            }
            Ok(false) => {}
            Err(source) => {
                tracing::error!(
                    execution_id = %execution.id,
                    workflow = %execution.workflow_name,
                    error = %source,
                    "execution completed but its status could not be recorded"
                );
                return Err(WorkflowError::CompletionNotRecorded {
                    execution_id: execution.id,
                    source,
                });
            }
        }

        // The timeout sweep moved the row off Running first; the deadline wins
        tracing::warn!(execution_id = %execution.id, "execution finished after its deadline");
        let cause = WorkflowError::TimeoutExceeded(execution.id);
        Err(self.fail(ctx, execution, cause).await)
    }

    /// Writes the `Completed` row, retrying transient store errors a few
    /// times with a growing delay.
    async fn record_completion(
        &self,
        completed: &WorkflowExecution,
    ) -> std::result::Result<bool, execution_store::StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .inner
                .store
                .update_execution_if(completed, ExecutionStatus::Running)
                .await
            {
                Ok(written) => return Ok(written),
                Err(e) if attempt < COMPLETION_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        execution_id = %completed.id,
                        attempt,
                        error = %e,
                        "failed to record completion, retrying"
                    );
                    tokio::time::sleep(COMPLETION_WRITE_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Marks the execution failed, unwinds its compensations, and settles
    /// the final status.
    async fn fail(
        &self,
        ctx: &WorkflowContext,
        execution: &mut WorkflowExecution,
        cause: WorkflowError,
    ) -> WorkflowError {
        if matches!(cause, WorkflowError::TimeoutExceeded(_)) {
            execution.time_out();
            // The sweep may already have recorded the timeout
            if let Err(e) = self
                .inner
                .store
                .update_execution_if(execution, ExecutionStatus::Running)
                .await
            {
                tracing::error!(execution_id = %execution.id, error = %e, "failed to record timeout");
            }
        }

        execution.fail(cause.to_string(), cause.is_retryable());
        self.persist(execution).await;
        let pending = ctx.pending_compensations().await;
        tracing::warn!(
            execution_id = %execution.id,
            error = %cause,
            pending,
            "execution failed, compensating"
        );

        let compensation_failures = ctx.unwind().await;
        execution.finish_compensation(compensation_failures.is_empty());
        self.persist(execution).await;

        if compensation_failures.is_empty() {
            tracing::info!(execution_id = %execution.id, "execution compensated");
        } else {
            tracing::error!(
                execution_id = %execution.id,
                workflow = %execution.workflow_name,
                failed_compensations = compensation_failures.len(),
                "execution partially compensated, manual reconciliation required"
            );
        }

        WorkflowError::ExecutionFailed {
            execution_id: execution.id,
            status: execution.status,
            compensation_failures,
            cause: Box::new(cause),
        }
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.inner.store.update_execution(execution).await {
            tracing::error!(
                execution_id = %execution.id,
                status = %execution.status,
                error = %e,
                "failed to persist execution"
            );
        }
    }

    async fn acquire_lease(&self, key: String) -> Result<LockLease> {
        let config = &self.inner.config;
        let token = self
            .inner
            .locks
            .acquire_with_backoff(&key, config.lock_ttl, config.acquire_options())
            .await?;

        match token {
            Some(token) => Ok(LockLease {
                key,
                token,
                locks: Arc::clone(&self.inner.locks),
                released: false,
            }),
            None => {
                metrics::counter!("workflow_lock_acquisition_failures_total").increment(1);
                tracing::warn!(lock_key = %key, "lock acquisition failed");
                Err(WorkflowError::LockAcquisitionFailed(key))
            }
        }
    }

    /// Keeps the lock alive for executions that may outlive its TTL.
    fn spawn_renewal(&self, lease: &LockLease, budget: chrono::Duration) -> Option<RenewalTask> {
        let ttl = self.inner.config.lock_ttl;
        let period = ttl / 2;
        if period.is_zero() || budget.to_std().ok()? <= ttl {
            return None;
        }

        let locks = Arc::clone(&lease.locks);
        let key = lease.key.clone();
        let token = lease.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match locks.renew(&key, &token, ttl).await {
                    Ok(true) => tracing::debug!(lock_key = %key, "lock renewed"),
                    Ok(false) => {
                        tracing::warn!(lock_key = %key, "lock lost before renewal");
                        break;
                    }
                    Err(e) => tracing::warn!(lock_key = %key, error = %e, "lock renewal failed"),
                }
            }
        });
        Some(RenewalTask(handle))
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// A held business-key lock.
///
/// Released explicitly on every normal exit path. If the owning future is
/// dropped first, the release is spawned onto the runtime.
struct LockLease {
    key: String,
    token: LockToken,
    locks: Arc<dyn LockProvider>,
    released: bool,
}

impl LockLease {
    async fn release(mut self) {
        self.released = true;
        match self.locks.release(&self.key, &self.token).await {
            Ok(true) => tracing::debug!(lock_key = %self.key, "lock released"),
            Ok(false) => tracing::warn!(lock_key = %self.key, "lock expired before release"),
            Err(e) => tracing::warn!(lock_key = %self.key, error = %e, "lock release failed"),
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lock_key = %self.key, "lock dropped outside a runtime, left to expire");
            return;
        };
        let locks = Arc::clone(&self.locks);
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        handle.spawn(async move {
            if let Err(e) = locks.release(&key, &token).await {
                tracing::warn!(lock_key = %key, error = %e, "background lock release failed");
            }
        });
    }
}

async fn release(lease: Option<LockLease>) {
    if let Some(lease) = lease {
        lease.release().await;
    }
}

struct RenewalTask(JoinHandle<()>);

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Entry in the engine's map of locally running executions, removed on drop.
struct ActiveGuard<'a> {
    active: &'a ActiveMap,
    execution_id: ExecutionId,
    signal: Arc<InterruptSignal>,
}

impl<'a> ActiveGuard<'a> {
    fn register(
        active: &'a ActiveMap,
        execution_id: ExecutionId,
        signal: Arc<InterruptSignal>,
    ) -> Self {
        active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id, Arc::clone(&signal));
        Self {
            active,
            execution_id,
            signal,
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        // A retry of the same id may already have registered a new signal
        if active
            .get(&self.execution_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.signal))
        {
            active.remove(&self.execution_id);
        }
    }
}
