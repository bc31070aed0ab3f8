//! The backend contract consumed by the execution core.
//!
//! A backend brokers workflow and activity tasks and persists history. Every
//! completion operation is a single atomic transition; the engine's
//! durability guarantees rest on that.

use async_trait::async_trait;
use heddle_core::history::{Event, WorkflowEvent};
use heddle_core::instance::WorkflowInstance;
use heddle_core::task::{ActivityTask, WorkflowTask};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),
    #[error("workflow instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("workflow instance already finished: {0}")]
    InstanceFinished(String),
    #[error("task lease lost for {0}")]
    LeaseLost(String),
    #[error("activity task not found: {0}")]
    ActivityTaskNotFound(String),
    #[error("backend error: {0}")]
    Other(String),
}

/// Abstract task queue and event store.
///
/// Drivers (relational, embedded KV, in-process) implement exactly these
/// operations; the core interacts with storage through nothing else.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates a new workflow instance and makes it runnable.
    ///
    /// `event` must be the instance's `ExecutionStarted` event. Idempotent
    /// for the same `(instance_id, execution_id)` pair.
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        event: Event,
    ) -> Result<(), BackendError>;

    /// Appends a pending `SignalReceived` event, making the instance
    /// runnable. Fails once the instance is terminal.
    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError>;

    /// Requests cancellation: delivers a pending `ExecutionCanceled` event so
    /// the workflow observes cancellation and winds down on its own.
    async fn cancel_workflow_instance(&self, instance_id: &str) -> Result<(), BackendError>;

    /// Forcibly ends an instance by appending `ExecutionTerminated` directly
    /// to history. No further workflow code runs.
    async fn terminate_workflow_instance(&self, instance_id: &str) -> Result<(), BackendError>;

    /// Returns a task for an instance that has at least one pending event
    /// with `visible_at <= now` and is not currently leased, acquiring the
    /// lease. Returns `None` when no work is available; callers apply their
    /// own poll timeout.
    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError>;

    /// Renews the lease on an in-flight workflow task.
    async fn extend_workflow_task(&self, instance: &WorkflowInstance) -> Result<(), BackendError>;

    /// Atomically: appends `executed` to history (assigning sequence IDs),
    /// enqueues `activity_events` as activity tasks, stores `timer_events`
    /// as pending events behind their `visible_at` barrier, routes
    /// `workflow_events` to their target instances, releases the lease and
    /// advances the acknowledged sequence. Fails with
    /// [`BackendError::LeaseLost`] if the lease is gone.
    async fn complete_workflow_task(
        &self,
        task: WorkflowTask,
        executed: Vec<Event>,
        activity_events: Vec<Event>,
        timer_events: Vec<Event>,
        workflow_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError>;

    /// Returns a pending activity task under a lease, or `None` when idle.
    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError>;

    /// Renews the lease on an in-flight activity task.
    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError>;

    /// Atomically appends the result event to the owning instance and
    /// deletes the activity task.
    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<(), BackendError>;
}
