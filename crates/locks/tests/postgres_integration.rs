//! PostgreSQL lock provider integration tests
//!
//! Run with:
//!
//! ```bash
//! cargo test -p locks --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use locks::{AcquireOptions, LockProvider, LockProviderExt, PostgresLockProvider};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_workflow_locks.sql"
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

async fn get_test_provider() -> PostgresLockProvider {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE workflow_locks")
        .execute(&pool)
        .await
        .unwrap();

    PostgresLockProvider::new(pool)
}

const TTL: Duration = Duration::from_secs(30);

#[tokio::test]
async fn acquire_is_exclusive_until_release() {
    let provider = get_test_provider().await;

    let token = provider.acquire("cart:1", TTL).await.unwrap().unwrap();
    assert!(provider.acquire("cart:1", TTL).await.unwrap().is_none());
    assert!(provider.acquire("cart:2", TTL).await.unwrap().is_some());

    assert!(provider.release("cart:1", &token).await.unwrap());
    assert!(!provider.release("cart:1", &token).await.unwrap());
    assert!(provider.acquire("cart:1", TTL).await.unwrap().is_some());
}

#[tokio::test]
async fn expired_lock_is_taken_over() {
    let provider = get_test_provider().await;

    let stale = provider
        .acquire("cart:1", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let fresh = provider.acquire("cart:1", TTL).await.unwrap().unwrap();
    assert_ne!(stale, fresh);
    assert!(!provider.renew("cart:1", &stale, TTL).await.unwrap());
    assert!(!provider.release("cart:1", &stale).await.unwrap());
    assert!(provider.renew("cart:1", &fresh, TTL).await.unwrap());
}

#[tokio::test]
async fn concurrent_acquire_has_single_winner() {
    let provider = get_test_provider().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            provider.acquire("cart:race", TTL).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn acquire_with_backoff_and_purge() {
    let provider = get_test_provider().await;
    provider
        .acquire("cart:1", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();

    let options = AcquireOptions {
        attempts: 5,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    };
    let token = provider
        .acquire_with_backoff("cart:1", TTL, options)
        .await
        .unwrap();
    assert!(token.is_some());

    provider
        .acquire("cart:old", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.purge_expired().await.unwrap(), 1);
}
