//! Execution core of the heddle workflow engine.
//!
//! Workflows are ordinary async functions made durable through
//! deterministic replay: every external effect goes through the
//! [`WorkflowContext`](workflow::WorkflowContext) and is recorded as
//! history, and on every task the function is re-run from the top with
//! recorded results short-circuiting each await. The pieces:
//!
//! - [`sync`]: the cooperative scheduler, workflow futures, channels and
//!   select; the deterministic substrate workflow code runs on.
//! - [`workflow`]: the authoring context and the replay executor.
//! - [`registry`]: name-to-function maps shared by workers.
//! - [`worker`]: the poll/dispatch loops over a
//!   [`Backend`](heddle_backend::Backend).
//! - [`client`]: creating, signaling and canceling instances.
//! - [`tester`]: a mock-clock harness for workflow tests.
//!
//! ```rust,ignore
//! let registry = Registry::builder()
//!     .workflow("order", |ctx: WorkflowContext, (order_id,): (String,)| async move {
//!         let charged: bool = ctx
//!             .schedule_activity(ActivityOptions::default(), "charge", (order_id,))
//!             .await?;
//!         anyhow::Ok(charged)
//!     })
//!     .activity("charge", |_ctx, (order_id,): (String,)| async move {
//!         anyhow::Ok(true)
//!     })
//!     .build();
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let worker = Worker::new(Arc::clone(&backend), registry);
//! tokio::spawn(async move { worker.run(shutdown).await });
//! ```

pub mod activity;
pub mod client;
pub mod registry;
pub mod sync;
pub mod tester;
pub mod worker;
pub mod workflow;

pub use activity::{ActivityContext, ActivityExecutor};
pub use client::{Client, ClientError, WorkflowInstanceOptions};
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use sync::{Channel, Selector, WorkflowFuture};
pub use tester::WorkflowTester;
pub use worker::{Worker, WorkerOptions};
pub use workflow::{
    ActivityOptions, ExecutionResult, ExecutorError, RetryOptions, SignalChannel,
    SubWorkflowOptions, WorkflowContext, WorkflowExecutor,
};
