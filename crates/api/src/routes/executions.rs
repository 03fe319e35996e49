//! Execution lookup and operator actions.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ExecutionId;
use serde::Serialize;
use workflow::{ExecutionStatus, WorkflowExecution, WorkflowStepEvent};

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct ExecutionResponse {
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowStepEvent>,
    /// Driven by this process right now.
    pub running_here: bool,
}

#[derive(Serialize)]
pub struct RetryResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub cancelled: bool,
}

/// GET /executions/{id}: an execution with its step history.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    let execution = state
        .engine
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Execution {id} not found")))?;
    let steps = state.engine.step_history(execution_id).await?;

    Ok(Json(ExecutionResponse {
        execution,
        steps,
        running_here: state.engine.is_running_here(execution_id),
    }))
}

/// POST /executions/{id}/retry: re-runs a compensated execution now.
#[tracing::instrument(skip(state))]
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let execution_id = parse_execution_id(&id)?;

    match state.engine.retry_execution(execution_id).await {
        Ok(output) => Ok(Json(RetryResponse {
            execution_id: id,
            status: ExecutionStatus::Completed,
            output: Some(output),
        })),
        // A settled failure is still a valid answer for the operator
        Err(err) => match err.final_status() {
            Some(status) => Ok(Json(RetryResponse {
                execution_id: id,
                status,
                output: None,
            })),
            None => Err(err.into()),
        },
    }
}

/// POST /executions/{id}/cancel: asks a locally running execution to stop
/// before its next step.
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    if !state.engine.is_running_here(execution_id) {
        return Err(ApiError::NotFound(format!(
            "Execution {id} is not running on this instance"
        )));
    }

    Ok(Json(CancelResponse {
        execution_id: id,
        cancelled: state.engine.cancel(execution_id),
    }))
}

fn parse_execution_id(id: &str) -> Result<ExecutionId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
