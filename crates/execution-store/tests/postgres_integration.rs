//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p execution-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Utc;
use execution_store::{
    ExecutionId, ExecutionQuery, ExecutionStatus, ExecutionStore, ExecutionStoreExt,
    PostgresExecutionStore, StepStatus, StoreError, WorkflowExecution, WorkflowStepEvent,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_workflow_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresExecutionStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    // Clear tables for test isolation
    sqlx::query("TRUNCATE TABLE workflow_step_events, workflow_executions")
        .execute(&pool)
        .await
        .unwrap();

    PostgresExecutionStore::new(pool)
}

fn create_test_execution(name: &str) -> WorkflowExecution {
    WorkflowExecution::start(
        ExecutionId::new(),
        name,
        serde_json::json!({"cart_id": "cart-1"}),
        "corr-pg",
        chrono::Duration::seconds(60),
    )
}

#[tokio::test]
async fn insert_and_retrieve_execution() {
    let store = get_test_store().await;
    let exec = create_test_execution("place-order").with_lock("cart:complete:1", "tok-1");

    store.insert_execution(&exec).await.unwrap();

    let loaded = store.require_execution(exec.id).await.unwrap();
    assert_eq!(loaded.workflow_name, "place-order");
    assert_eq!(loaded.status, ExecutionStatus::Running);
    assert_eq!(loaded.lock_key.as_deref(), Some("cart:complete:1"));
    assert_eq!(loaded.input, serde_json::json!({"cart_id": "cart-1"}));
    assert_eq!(loaded.attempt_count, 1);
}

#[tokio::test]
async fn duplicate_insert_is_rejected() {
    let store = get_test_store().await;
    let exec = create_test_execution("place-order");

    store.insert_execution(&exec).await.unwrap();
    let result = store.insert_execution(&exec).await;

    assert!(matches!(result, Err(StoreError::DuplicateExecution(_))));
}

#[tokio::test]
async fn update_and_conditional_transition() {
    let store = get_test_store().await;
    let mut exec = create_test_execution("place-order");
    store.insert_execution(&exec).await.unwrap();

    exec.time_out();
    assert!(
        store
            .update_execution_if(&exec, ExecutionStatus::Running)
            .await
            .unwrap()
    );
    assert!(
        !store
            .update_execution_if(&exec, ExecutionStatus::Running)
            .await
            .unwrap()
    );

    exec.fail("owner lost", false);
    store.update_execution(&exec).await.unwrap();
    let loaded = store.require_execution(exec.id).await.unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Failed);
    assert_eq!(loaded.last_error.as_deref(), Some("owner lost"));

    let missing = create_test_execution("place-order");
    assert!(matches!(
        store.update_execution(&missing).await,
        Err(StoreError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn query_by_status_and_retry_eligibility() {
    let store = get_test_store().await;

    let mut retryable = create_test_execution("place-order");
    retryable.fail("gateway timeout", true);
    retryable.finish_compensation(true);
    let mut permanent = create_test_execution("place-order");
    permanent.fail("card declined", false);
    permanent.finish_compensation(true);
    let running = create_test_execution("place-order");

    for exec in [&retryable, &permanent, &running] {
        store.insert_execution(exec).await.unwrap();
    }

    let found = store
        .find_executions(
            ExecutionQuery::for_status(ExecutionStatus::Compensated)
                .finished_after(Utc::now() - chrono::Duration::hours(1))
                .retryable(true)
                .attempts_below(3),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, retryable.id);

    let all = store
        .find_executions(ExecutionQuery::new().limit(2))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn step_events_and_stale_detection() {
    let store = get_test_store().await;
    let exec = create_test_execution("place-order");
    store.insert_execution(&exec).await.unwrap();

    let done = WorkflowStepEvent::started(exec.id, 1, "reserve-inventory", 0, serde_json::json!({}));
    let stuck = WorkflowStepEvent::started(exec.id, 1, "authorize-payment", 1, serde_json::json!({}));
    store.append_step_event(&done).await.unwrap();
    store
        .append_step_event(&done.completed(serde_json::json!({"reservation_id": "RES-1"})))
        .await
        .unwrap();
    store.append_step_event(&stuck).await.unwrap();

    let events = store.get_step_events(exec.id).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].status, StepStatus::Completed);

    let stale = store
        .find_stale_steps(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].step_index, 1);

    let orphan = WorkflowStepEvent::started(ExecutionId::new(), 1, "x", 0, serde_json::json!({}));
    assert!(matches!(
        store.append_step_event(&orphan).await,
        Err(StoreError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn retention_cleanup_cascades_step_events() {
    let store = get_test_store().await;
    let mut old = create_test_execution("place-order");
    old.complete(serde_json::json!({"order_id": "ORD-1"}));
    old.finished_at = Some(Utc::now() - chrono::Duration::days(45));
    store.insert_execution(&old).await.unwrap();
    store
        .append_step_event(&WorkflowStepEvent::started(
            old.id,
            1,
            "create-order",
            0,
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let deleted = store
        .delete_finished_before(Utc::now() - chrono::Duration::days(30))
        .await
        .unwrap();

    assert_eq!(deleted, 1);
    assert!(store.get_execution(old.id).await.unwrap().is_none());
    assert!(store.get_step_events(old.id).await.unwrap().is_empty());
    store.ping().await.unwrap();
}
