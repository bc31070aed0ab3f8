//! Long-running workers: poll tasks from the backend, dispatch them to the
//! executors, commit the outcomes.
//!
//! Each worker runs two cooperating loops. The poll loop fetches tasks and
//! feeds a bounded queue; the dispatch loop takes tasks from the queue and
//! spawns one execution per task, gated by a semaphore. Distinct instances
//! execute concurrently; the backend lease guarantees a single writer per
//! instance. While a task is in flight a heartbeat renews its lease; if the
//! lease is lost anyway the result is dropped and the task is redelivered.

use crate::activity::{failed_event, ActivityExecutor};
use crate::registry::Registry;
use crate::workflow::executor::WorkflowExecutor;
use heddle_backend::{Backend, BackendError};
use heddle_core::clock::{Clock, WallClock};
use heddle_core::converter::Converter;
use heddle_core::task::{ActivityTask, WorkflowTask};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Tuning for both workers. Lease duration itself is a backend property;
/// the heartbeat interval here must stay below it.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_concurrent_workflow_tasks: usize,
    pub max_concurrent_activity_tasks: usize,
    pub workflow_poll_interval: Duration,
    pub activity_poll_interval: Duration,
    pub workflow_poll_timeout: Duration,
    pub activity_poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single activity execution; exceeding it records an
    /// `ActivityFailed` event. `None` means unbounded.
    pub activity_execution_timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workflow_tasks: 10,
            max_concurrent_activity_tasks: 10,
            workflow_poll_interval: Duration::from_millis(200),
            activity_poll_interval: Duration::from_millis(200),
            workflow_poll_timeout: Duration::from_secs(30),
            activity_poll_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            activity_execution_timeout: None,
        }
    }
}

/// Workflow worker and activity worker combined; most deployments run both
/// in one process.
pub struct Worker<B, C: Converter> {
    backend: Arc<B>,
    registry: Arc<Registry<C>>,
    options: WorkerOptions,
    clock: Arc<dyn Clock>,
}

impl<B, C> Worker<B, C>
where
    B: Backend + 'static,
    C: Converter,
{
    pub fn new(backend: Arc<B>, registry: Registry<C>) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
            options: WorkerOptions::default(),
            clock: Arc::new(WallClock),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs both workers until the token is canceled. Cancellation tears
    /// down the pollers; in-flight durable state is never touched.
    pub async fn run(&self, shutdown: CancellationToken) {
        let workflow_worker = WorkflowWorker {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            options: self.options.clone(),
            clock: Arc::clone(&self.clock),
        };
        let activity_worker = ActivityWorker {
            backend: Arc::clone(&self.backend),
            executor: Arc::new(ActivityExecutor::new(Arc::clone(&self.registry))),
            options: self.options.clone(),
            clock: Arc::clone(&self.clock),
        };
        tokio::join!(workflow_worker.run(shutdown.clone()), activity_worker.run(shutdown));
    }
}

pub struct WorkflowWorker<B, C: Converter> {
    backend: Arc<B>,
    registry: Arc<Registry<C>>,
    options: WorkerOptions,
    clock: Arc<dyn Clock>,
}

impl<B, C> WorkflowWorker<B, C>
where
    B: Backend + 'static,
    C: Converter,
{
    pub async fn run(self, shutdown: CancellationToken) {
        let capacity = self.options.max_concurrent_workflow_tasks.max(1);
        let (queue_tx, mut queue_rx) = mpsc::channel::<WorkflowTask>(capacity);

        let poller = tokio::spawn(poll_loop(
            Arc::clone(&self.backend),
            queue_tx,
            shutdown.clone(),
            self.options.workflow_poll_timeout,
            self.options.workflow_poll_interval,
            |backend| async move { backend.get_workflow_task().await },
        ));

        let semaphore = Arc::new(Semaphore::new(capacity));
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = queue_rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let backend = Arc::clone(&self.backend);
            let registry = Arc::clone(&self.registry);
            let clock = Arc::clone(&self.clock);
            let heartbeat_interval = self.options.heartbeat_interval;
            tokio::spawn(async move {
                let _permit = permit;
                handle_workflow_task(backend, registry, clock, heartbeat_interval, task).await;
            });
        }

        poller.abort();
        let _ = poller.await;
    }
}

async fn handle_workflow_task<B, C>(
    backend: Arc<B>,
    registry: Arc<Registry<C>>,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
    task: WorkflowTask,
) where
    B: Backend + 'static,
    C: Converter,
{
    let instance = task.instance.clone();
    tracing::debug!(
        instance_id = %instance.instance_id,
        new_events = task.new_events.len(),
        "dispatching workflow task"
    );

    let heartbeat = tokio::spawn({
        let backend = Arc::clone(&backend);
        let instance = instance.clone();
        async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = backend.extend_workflow_task(&instance).await {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "failed to extend workflow task lease"
                    );
                }
            }
        }
    });

    let executor_task = task.clone();
    let execution = tokio::task::spawn_blocking(move || {
        WorkflowExecutor::new(registry, clock).execute_task(&executor_task)
    })
    .await;
    heartbeat.abort();

    match execution {
        Ok(Ok(result)) => {
            let completed = result.completed;
            let outcome = backend
                .complete_workflow_task(
                    task,
                    result.executed,
                    result.activity_events,
                    result.timer_events,
                    result.workflow_events,
                )
                .await;
            match outcome {
                Ok(()) => {
                    tracing::debug!(
                        instance_id = %instance.instance_id,
                        completed,
                        "completed workflow task"
                    );
                }
                Err(BackendError::LeaseLost(_)) => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        "lease lost; dropping workflow task result"
                    );
                }
                Err(BackendError::InstanceFinished(_)) => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        "instance finished concurrently; dropping workflow task result"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "failed to complete workflow task"
                    );
                }
            }
        }
        Ok(Err(e)) => {
            // Nothing is committed; the instance stays runnable and the
            // task is redelivered once the lease expires.
            tracing::error!(
                instance_id = %instance.instance_id,
                error = %e,
                "workflow task execution failed"
            );
        }
        Err(e) => {
            tracing::error!(
                instance_id = %instance.instance_id,
                error = %e,
                "workflow task execution panicked"
            );
        }
    }
}

pub struct ActivityWorker<B, C: Converter> {
    backend: Arc<B>,
    executor: Arc<ActivityExecutor<C>>,
    options: WorkerOptions,
    clock: Arc<dyn Clock>,
}

impl<B, C> ActivityWorker<B, C>
where
    B: Backend + 'static,
    C: Converter,
{
    pub async fn run(self, shutdown: CancellationToken) {
        let capacity = self.options.max_concurrent_activity_tasks.max(1);
        let (queue_tx, mut queue_rx) = mpsc::channel::<ActivityTask>(capacity);

        let poller = tokio::spawn(poll_loop(
            Arc::clone(&self.backend),
            queue_tx,
            shutdown.clone(),
            self.options.activity_poll_timeout,
            self.options.activity_poll_interval,
            |backend| async move { backend.get_activity_task().await },
        ));

        let semaphore = Arc::new(Semaphore::new(capacity));
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = queue_rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let backend = Arc::clone(&self.backend);
            let executor = Arc::clone(&self.executor);
            let clock = Arc::clone(&self.clock);
            let heartbeat_interval = self.options.heartbeat_interval;
            let execution_timeout = self.options.activity_execution_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                handle_activity_task(
                    backend,
                    executor,
                    clock,
                    heartbeat_interval,
                    execution_timeout,
                    task,
                )
                .await;
            });
        }

        poller.abort();
        let _ = poller.await;
    }
}

async fn handle_activity_task<B, C>(
    backend: Arc<B>,
    executor: Arc<ActivityExecutor<C>>,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
    execution_timeout: Option<Duration>,
    task: ActivityTask,
) where
    B: Backend + 'static,
    C: Converter,
{
    let heartbeat = tokio::spawn({
        let backend = Arc::clone(&backend);
        let task_id = task.id.clone();
        async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = backend.extend_activity_task(&task_id).await {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to extend activity lease");
                }
            }
        }
    });

    let event = match execution_timeout {
        Some(limit) => match tokio::time::timeout(limit, executor.execute(&task, clock.now())).await
        {
            Ok(event) => event,
            Err(_) => {
                tracing::warn!(task_id = %task.id, "activity execution timed out");
                failed_event(
                    clock.now(),
                    task.event.schedule_event_id,
                    "activity execution timed out".to_string(),
                )
            }
        },
        None => executor.execute(&task, clock.now()).await,
    };
    heartbeat.abort();

    match backend.complete_activity_task(&task.instance, &task.id, event).await {
        Ok(()) => {
            tracing::debug!(task_id = %task.id, "completed activity task");
        }
        Err(BackendError::LeaseLost(_)) => {
            tracing::warn!(task_id = %task.id, "lease lost; dropping activity result");
        }
        Err(e) => {
            tracing::error!(task_id = %task.id, error = %e, "failed to complete activity task");
        }
    }
}

/// Polls the backend until shutdown. `None` results and transient errors
/// back off for `poll_interval`; a slow backend call is bounded by
/// `poll_timeout` and simply retried.
async fn poll_loop<B, T, F, Fut>(
    backend: Arc<B>,
    queue: mpsc::Sender<T>,
    shutdown: CancellationToken,
    poll_timeout: Duration,
    poll_interval: Duration,
    poll: F,
) where
    B: Backend + 'static,
    F: Fn(Arc<B>) -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, BackendError>>,
{
    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = tokio::time::timeout(poll_timeout, poll(Arc::clone(&backend))) => outcome,
        };

        match outcome {
            Ok(Ok(Some(task))) => {
                if queue.send(task).await.is_err() {
                    break;
                }
            }
            Ok(Ok(None)) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "task poll failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(_elapsed) => {}
        }
    }
}
