use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ExecutionId, ExecutionQuery, ExecutionStatus, Result, StepEventId, StoreError,
    WorkflowExecution, WorkflowStepEvent, store::ExecutionStore,
};

const EXECUTION_COLUMNS: &str = "id, workflow_name, input, output, status, correlation_id, \
     lock_key, lock_token, started_at, timeout_at, finished_at, last_error, retryable, \
     attempt_count, updated_at";

const STEP_EVENT_COLUMNS: &str = "id, execution_id, attempt, step_name, step_index, status, \
     started_at, finished_at, duration_ms, input, output, error, recorded_at";

/// PostgreSQL-backed execution store implementation.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Creates a new PostgreSQL execution store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_execution(row: PgRow) -> Result<WorkflowExecution> {
        let status: String = row.try_get("status")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(WorkflowExecution {
            id: ExecutionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            workflow_name: row.try_get("workflow_name")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            status: status.parse()?,
            correlation_id: row.try_get("correlation_id")?,
            lock_key: row.try_get("lock_key")?,
            lock_token: row.try_get("lock_token")?,
            started_at: row.try_get("started_at")?,
            timeout_at: row.try_get("timeout_at")?,
            finished_at: row.try_get("finished_at")?,
            last_error: row.try_get("last_error")?,
            retryable: row.try_get("retryable")?,
            attempt_count: u32::try_from(attempt_count)
                .map_err(|_| StoreError::InvalidData(format!("negative attempt count {attempt_count}")))?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_step_event(row: PgRow) -> Result<WorkflowStepEvent> {
        let status: String = row.try_get("status")?;
        let attempt: i32 = row.try_get("attempt")?;
        let step_index: i32 = row.try_get("step_index")?;

        Ok(WorkflowStepEvent {
            id: StepEventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            execution_id: ExecutionId::from_uuid(row.try_get::<Uuid, _>("execution_id")?),
            attempt: u32::try_from(attempt)
                .map_err(|_| StoreError::InvalidData(format!("negative attempt {attempt}")))?,
            step_name: row.try_get("step_name")?,
            step_index: u32::try_from(step_index)
                .map_err(|_| StoreError::InvalidData(format!("negative step index {step_index}")))?,
            status: status.parse()?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_ms: row.try_get("duration_ms")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn map_insert_error(id: ExecutionId, e: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StoreError::DuplicateExecution(id);
        }
        StoreError::Database(e)
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[tracing::instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_name, input, output, status, correlation_id,
                lock_key, lock_token, started_at, timeout_at, finished_at, last_error, retryable,
                attempt_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(&execution.workflow_name)
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(execution.status.as_str())
        .bind(&execution.correlation_id)
        .bind(&execution.lock_key)
        .bind(&execution.lock_token)
        .bind(execution.started_at)
        .bind(execution.timeout_at)
        .bind(execution.finished_at)
        .bind(&execution.last_error)
        .bind(execution.retryable)
        .bind(execution.attempt_count as i32)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_error(execution.id, e))?;

        Ok(())
    }

    #[tracing::instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status))]
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET
                output = $2, status = $3, lock_key = $4, lock_token = $5, started_at = $6,
                timeout_at = $7, finished_at = $8, last_error = $9, retryable = $10,
                attempt_count = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(&execution.output)
        .bind(execution.status.as_str())
        .bind(&execution.lock_key)
        .bind(&execution.lock_token)
        .bind(execution.started_at)
        .bind(execution.timeout_at)
        .bind(execution.finished_at)
        .bind(&execution.last_error)
        .bind(execution.retryable)
        .bind(execution.attempt_count as i32)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution.id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status))]
    async fn update_execution_if(
        &self,
        execution: &WorkflowExecution,
        expected: ExecutionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET
                output = $2, status = $3, lock_key = $4, lock_token = $5, started_at = $6,
                timeout_at = $7, finished_at = $8, last_error = $9, retryable = $10,
                attempt_count = $11, updated_at = $12
            WHERE id = $1 AND status = $13
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(&execution.output)
        .bind(execution.status.as_str())
        .bind(&execution.lock_key)
        .bind(&execution.lock_token)
        .bind(execution.started_at)
        .bind(execution.timeout_at)
        .bind(execution.finished_at)
        .bind(&execution.last_error)
        .bind(execution.retryable)
        .bind(execution.attempt_count as i32)
        .bind(execution.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "status moved on" from "never existed"
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM workflow_executions WHERE id = $1")
                .bind(execution.id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => {
                tracing::debug!("status moved on, conditional update skipped");
                Ok(false)
            }
            None => Err(StoreError::ExecutionNotFound(execution.id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_execution).transpose()
    }

    #[tracing::instrument(skip(self, query))]
    async fn find_executions(&self, query: ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let mut sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.workflow_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND workflow_name = ${param_count}"));
        }
        if query.started_after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND started_at >= ${param_count}"));
        }
        if query.started_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND started_at <= ${param_count}"));
        }
        if query.finished_after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND finished_at >= ${param_count}"));
        }
        if query.finished_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND finished_at <= ${param_count}"));
        }
        if query.timeout_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timeout_at <= ${param_count}"));
        }
        if query.retryable.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND retryable = ${param_count}"));
        }
        if query.attempts_below.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND attempt_count < ${param_count}"));
        }

        sql.push_str(" ORDER BY started_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        // Build and execute query with parameters
        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(names);
        }
        if let Some(name) = query.workflow_name {
            sqlx_query = sqlx_query.bind(name);
        }
        if let Some(ts) = query.started_after {
            sqlx_query = sqlx_query.bind(ts);
        }
        if let Some(ts) = query.started_before {
            sqlx_query = sqlx_query.bind(ts);
        }
        if let Some(ts) = query.finished_after {
            sqlx_query = sqlx_query.bind(ts);
        }
        if let Some(ts) = query.finished_before {
            sqlx_query = sqlx_query.bind(ts);
        }
        if let Some(ts) = query.timeout_before {
            sqlx_query = sqlx_query.bind(ts);
        }
        if let Some(retryable) = query.retryable {
            sqlx_query = sqlx_query.bind(retryable);
        }
        if let Some(max_attempts) = query.attempts_below {
            sqlx_query = sqlx_query.bind(max_attempts as i32);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_execution).collect()
    }

    #[tracing::instrument(skip(self, event), fields(execution_id = %event.execution_id, step = %event.step_name))]
    async fn append_step_event(&self, event: &WorkflowStepEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_step_events (id, execution_id, attempt, step_name, step_index,
                status, started_at, finished_at, duration_ms, input, output, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.execution_id.as_uuid())
        .bind(event.attempt as i32)
        .bind(&event.step_name)
        .bind(event.step_index as i32)
        .bind(event.status.as_str())
        .bind(event.started_at)
        .bind(event.finished_at)
        .bind(event.duration_ms)
        .bind(&event.input)
        .bind(&event.output)
        .bind(&event.error)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_foreign_key_violation()
            {
                return StoreError::ExecutionNotFound(event.execution_id);
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<WorkflowStepEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_EVENT_COLUMNS} FROM workflow_step_events \
             WHERE execution_id = $1 ORDER BY recorded_at ASC, step_index ASC"
        ))
        .bind(execution_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step_event).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn find_stale_steps(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<WorkflowStepEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {STEP_EVENT_COLUMNS} FROM workflow_step_events s
            WHERE s.status = 'STARTED'
              AND s.started_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_step_events f
                  WHERE f.execution_id = s.execution_id
                    AND f.attempt = s.attempt
                    AND f.step_index = s.step_index
                    AND f.status IN ('COMPLETED', 'FAILED')
              )
            ORDER BY s.started_at ASC
            "#
        ))
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step_event).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        // Step events go with their execution via ON DELETE CASCADE
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_executions
            WHERE status IN ('COMPLETED', 'COMPENSATED', 'PARTIALLY_COMPENSATED')
              AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        tracing::debug!(deleted = result.rows_affected(), "deleted finished executions");
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
