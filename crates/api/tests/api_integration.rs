//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use execution_store::InMemoryExecutionStore;
use locks::InMemoryLockProvider;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceExt;
use workflow::{
    EngineConfig, ExecuteOptions, ExecutionId, ORDER_PLACEMENT, OrderLine, PlaceOrder,
    PlacedOrder, WorkflowEngine,
};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn in_memory_engine() -> WorkflowEngine {
    api::create_engine(
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(InMemoryLockProvider::new()),
        EngineConfig::default(),
    )
    .unwrap()
}

fn setup_with_engine(engine: WorkflowEngine) -> axum::Router {
    let state = Arc::new(AppState {
        engine,
        health_lookback: Duration::from_secs(3600),
    });
    api::create_app(state, get_metrics_handle())
}

fn setup() -> (axum::Router, WorkflowEngine) {
    let engine = in_memory_engine();
    (setup_with_engine(engine.clone()), engine)
}

async fn place_order(engine: &WorkflowEngine, sku: &str) -> ExecutionId {
    let id = ExecutionId::new();
    let cart = PlaceOrder {
        cart_id: format!("cart-{id}"),
        customer_id: "cust-1".to_string(),
        lines: vec![OrderLine::new(sku, 1, 1500)],
    };
    let _ = engine
        .execute::<PlaceOrder, PlacedOrder>(
            ORDER_PLACEMENT,
            cart,
            ExecuteOptions::new().execution_id(id),
        )
        .await;
    id
}

async fn send(app: axum::Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = send(app, "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["healthy"], true);
    assert_eq!(json["registered_workflows"], 1);
    assert_eq!(json["workflow_names"][0], ORDER_PLACEMENT);
}

#[tokio::test]
async fn test_health_unavailable_without_workflows() {
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(InMemoryLockProvider::new()),
        EngineConfig::default(),
    );
    let app = setup_with_engine(engine);

    let (status, json) = send(app, "GET", "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["store_reachable"], true);
}

#[tokio::test]
async fn test_health_counts_recent_failures() {
    let (app, engine) = setup();
    place_order(&engine, "SKU-MISSING").await;

    let (status, json) = send(app, "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["recent_failures"], 1);
}

#[tokio::test]
async fn test_list_workflows() {
    let (app, _) = setup();

    let (status, json) = send(app, "GET", "/workflows").await;

    assert_eq!(status, StatusCode::OK);
    let workflows = json.as_array().unwrap();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0]["name"], ORDER_PLACEMENT);
    assert!(
        workflows[0]["input_type"]
            .as_str()
            .unwrap()
            .ends_with("PlaceOrder")
    );
}

#[tokio::test]
async fn test_get_execution_with_steps() {
    let (app, engine) = setup();
    let id = place_order(&engine, "SKU-001").await;

    let (status, json) = send(app, "GET", &format!("/executions/{id}")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["execution"]["status"], "COMPLETED");
    assert_eq!(json["running_here"], false);
    // Four steps, each recorded as started and completed
    assert_eq!(json["steps"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn test_get_execution_not_found() {
    let (app, _) = setup();

    let (status, json) = send(app, "GET", &format!("/executions/{}", ExecutionId::new())).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().is_some());
}

#[tokio::test]
async fn test_invalid_execution_id() {
    let (app, _) = setup();

    let (status, _) = send(app, "GET", "/executions/not-a-uuid").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_retry_completed_execution_conflicts() {
    let (app, engine) = setup();
    let id = place_order(&engine, "SKU-001").await;

    let (status, _) = send(app, "POST", &format!("/executions/{id}/retry")).await;

    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_retry_unknown_execution() {
    let (app, _) = setup();

    let (status, _) = send(
        app,
        "POST",
        &format!("/executions/{}/retry", ExecutionId::new()),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_requires_local_execution() {
    let (app, _) = setup();

    let (status, _) = send(
        app,
        "POST",
        &format!("/executions/{}/cancel", ExecutionId::new()),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, engine) = setup();
    place_order(&engine, "SKU-001").await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.contains("text/plain"));
}
