//! Operational HTTP server for the workflow engine.
//!
//! Exposes health, Prometheus metrics, the workflow registry and execution
//! lookup, with structured logging (tracing) on every request.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use execution_store::ExecutionStore;
use locks::LockProvider;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use workflow::{
    EngineConfig, InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService,
    ORDER_PLACEMENT, OrderPlacementWorkflow, WorkflowEngine,
};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: WorkflowEngine,
    /// Window for the recent-failure count in `/health`.
    pub health_lookback: Duration,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/workflows", get(routes::workflows::list))
        .route("/executions/{id}", get(routes::executions::get))
        .route("/executions/{id}/retry", post(routes::executions::retry))
        .route("/executions/{id}/cancel", post(routes::executions::cancel))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds an engine over the given backends with the order placement
/// workflow registered against in-memory business services.
pub fn create_engine(
    store: Arc<dyn ExecutionStore>,
    locks: Arc<dyn LockProvider>,
    config: EngineConfig,
) -> workflow::Result<WorkflowEngine> {
    let inventory = InMemoryInventoryService::new();
    for sku in ["SKU-001", "SKU-002", "SKU-003"] {
        inventory.set_stock(sku, 1_000);
    }

    let engine = WorkflowEngine::new(store, locks, config);
    engine.register(
        ORDER_PLACEMENT,
        OrderPlacementWorkflow::new(
            Arc::new(inventory),
            Arc::new(InMemoryPaymentService::new()),
            Arc::new(InMemoryOrderService::new()),
        ),
    )?;
    Ok(engine)
}

/// Registers descriptions for the engine's metrics so the exporter renders
/// HELP lines.
pub fn describe_metrics() {
    metrics::describe_counter!("workflow_executions_total", "Executions started");
    metrics::describe_counter!(
        "workflow_executions_completed",
        "Executions that completed successfully"
    );
    metrics::describe_counter!(
        "workflow_executions_failed",
        "Executions that ended in a failure status"
    );
    metrics::describe_histogram!(
        "workflow_execution_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time from execution start to settlement"
    );
    metrics::describe_counter!("workflow_steps_total", "Steps dispatched");
    metrics::describe_counter!("workflow_step_failures_total", "Steps that returned an error");
    metrics::describe_histogram!(
        "workflow_step_duration_seconds",
        metrics::Unit::Seconds,
        "Step execution time"
    );
    metrics::describe_counter!("workflow_compensations_total", "Compensations run");
    metrics::describe_counter!(
        "workflow_compensation_failures_total",
        "Compensations that failed or panicked"
    );
    metrics::describe_counter!(
        "workflow_lock_acquisition_failures_total",
        "Executions rejected because their business-key lock stayed busy"
    );
    metrics::describe_gauge!(
        "workflow_maintenance_stale_steps",
        "Steps started past the stale threshold without finishing"
    );
}
