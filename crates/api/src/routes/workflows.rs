//! Registered workflow listing.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use workflow::WorkflowInfo;

use crate::AppState;

/// GET /workflows: every registered workflow with its input and output types.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowInfo>> {
    Json(state.engine.list_workflows())
}
