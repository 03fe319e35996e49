//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::Config;
use execution_store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};
use locks::{InMemoryLockProvider, LockProvider, PostgresLockProvider};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workflow::{EngineConfig, Maintenance, MaintenanceConfig};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Connects the PostgreSQL backends when a database is configured,
/// otherwise falls back to in-memory ones.
async fn backends(config: &Config) -> (Arc<dyn ExecutionStore>, Arc<dyn LockProvider>) {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory execution store and locks");
        return (
            Arc::new(InMemoryExecutionStore::new()),
            Arc::new(InMemoryLockProvider::new()),
        );
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");

    let store = PostgresExecutionStore::new(pool.clone());
    store
        .run_migrations()
        .await
        .expect("failed to run migrations");
    tracing::info!("connected to PostgreSQL");

    (Arc::new(store), Arc::new(PostgresLockProvider::new(pool)))
}

#[tokio::main]
async fn main() {
    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::describe_metrics();

    // 3. Build the engine over the configured backends
    let config = Config::from_env();
    let maintenance_config = MaintenanceConfig::from_env();
    let (store, locks) = backends(&config).await;
    let engine = api::create_engine(store, locks, EngineConfig::from_env())
        .expect("failed to register workflows");

    // 4. Start background recovery
    let health_lookback = maintenance_config.health_failure_lookback;
    let maintenance = Maintenance::new(engine.clone(), maintenance_config).spawn();

    // 5. Build the application
    let state = Arc::new(AppState {
        engine,
        health_lookback,
    });
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    maintenance.shutdown().await;
    tracing::info!("server shut down gracefully");
}
