//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use workflow::WorkflowError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Engine error.
    Workflow(WorkflowError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Workflow(err) => workflow_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn workflow_error_to_response(err: WorkflowError) -> (StatusCode, String) {
    let status = match &err {
        WorkflowError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::InputTypeMismatch { .. } => StatusCode::BAD_REQUEST,
        WorkflowError::NotRetryable { .. } | WorkflowError::LockAcquisitionFailed(_) => {
            StatusCode::CONFLICT
        }
        // The execution ran and settled; the caller gets the outcome
        WorkflowError::ExecutionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::Store(execution_store::StoreError::ExecutionNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        _ => {
            tracing::error!(error = %err, "internal server error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError::Workflow(err)
    }
}

#[cfg(test)]
mod tests {
    use common::ExecutionId;
    use workflow::ExecutionStatus;

    use super::*;

    #[test]
    fn maps_workflow_errors_to_status_codes() {
        let not_found = ApiError::from(WorkflowError::WorkflowNotFound("x".to_string()));
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let conflict = ApiError::from(WorkflowError::NotRetryable {
            execution_id: ExecutionId::new(),
            status: ExecutionStatus::Completed,
        });
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let bad = ApiError::BadRequest("nope".to_string());
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
