//! Saga workflow engine.
//!
//! A workflow is an ordinary async function that dispatches [`Step`]s through
//! a [`WorkflowContext`]. Each completed step that declares a compensation is
//! pushed onto the execution's compensation stack; when the workflow fails,
//! times out or is cancelled, the stack is unwound newest first.
//!
//! Executions run under an optional distributed lock and are recorded in an
//! [`ExecutionStore`](execution_store::ExecutionStore), which the
//! [`Maintenance`] loop scans for timed-out, stale and retryable work.

pub mod compensation;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod maintenance;
pub mod options;
pub mod order_placement;
pub mod registry;
pub mod services;
pub mod step;

pub use common::ExecutionId;
pub use compensation::{CompensationEntry, CompensationStack};
pub use config::{EngineConfig, MaintenanceConfig};
pub use context::WorkflowContext;
pub use engine::WorkflowEngine;
pub use error::{Result, WorkflowError};
pub use events::{
    BroadcastSink, EventSink, FanoutSink, InMemorySink, MetricsSink, NoopSink, SinkError,
    WorkflowEvent,
};
pub use execution_store::{ExecutionStatus, StepStatus, WorkflowExecution, WorkflowStepEvent};
pub use health::HealthReport;
pub use maintenance::{
    CleanupReport, Maintenance, MaintenanceHandle, RetrySweepReport, StaleStep, StaleStepReport,
    TimeoutSweepReport,
};
pub use options::ExecuteOptions;
pub use order_placement::{ORDER_PLACEMENT, OrderPlacementWorkflow, PlaceOrder, PlacedOrder};
pub use registry::{Workflow, WorkflowDefinition, WorkflowInfo, WorkflowRegistry};
pub use services::{
    Authorization, InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService,
    InventoryService, NewOrder, OrderLine, OrderService, PaymentService, Reservation,
    ServiceError,
};
pub use step::{Step, StepError, StepOutput};
