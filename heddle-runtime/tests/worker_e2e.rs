//! End-to-end tests: client → in-memory backend → workers → history.

use heddle_backend::InMemoryBackend;
use heddle_core::converter::{Converter, JsonConverter};
use heddle_core::payload::Payload;
use heddle_runtime::workflow::WorkflowContext;
use heddle_runtime::{
    ActivityOptions, Client, Registry, SubWorkflowOptions, Worker, WorkerOptions,
    WorkflowInstanceOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        workflow_poll_interval: Duration::from_millis(10),
        activity_poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_secs(5),
        ..WorkerOptions::default()
    }
}

fn start_worker(backend: Arc<InMemoryBackend>, registry: Registry) -> CancellationToken {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        Worker::new(backend, registry)
            .with_options(fast_options())
            .run(token)
            .await;
    });
    shutdown
}

async fn await_result(
    backend: &InMemoryBackend,
    instance_id: &str,
) -> Result<Option<Payload>, String> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(result) = backend.workflow_result(instance_id) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("workflow did not finish in time")
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Payload) -> T {
    JsonConverter.from_payload(payload).expect("failed to decode result")
}

#[tokio::test]
async fn workflow_runs_to_completion_through_the_worker() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("hello", |_ctx: WorkflowContext, (): ()| async move { anyhow::Ok(0i32) })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "hello", ())
        .await
        .unwrap();

    let result = await_result(&backend, &instance.instance_id).await.unwrap();
    assert_eq!(decode::<i32>(&result.unwrap()), 0);
    shutdown.cancel();
}

#[tokio::test]
async fn activity_round_trips_through_the_activity_worker() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("with-activity", |ctx: WorkflowContext, (a, b): (i32, i32)| async move {
            let sum: i32 = ctx
                .schedule_activity(ActivityOptions::default(), "add", (a, b))
                .await?;
            anyhow::Ok(sum)
        })
        .activity("add", |_ctx, (a, b): (i32, i32)| async move { anyhow::Ok(a + b) })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "with-activity", (19i32, 4i32))
        .await
        .unwrap();

    let result = await_result(&backend, &instance.instance_id).await.unwrap();
    assert_eq!(decode::<i32>(&result.unwrap()), 23);
    shutdown.cancel();
}

#[tokio::test]
async fn signal_wakes_a_waiting_workflow() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("await-signal", |ctx: WorkflowContext, (): ()| async move {
            let channel = ctx.signal_channel::<String>("go");
            let Some(value) = channel.receive().await else {
                anyhow::bail!("signal channel closed");
            };
            anyhow::Ok(value)
        })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "await-signal", ())
        .await
        .unwrap();

    // Give the workflow time to reach the suspension point, then signal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client
        .signal_workflow(&instance.instance_id, "go", &"s42")
        .await
        .unwrap();

    let result = await_result(&backend, &instance.instance_id).await.unwrap();
    assert_eq!(decode::<String>(&result.unwrap()), "s42");
    shutdown.cancel();
}

#[tokio::test]
async fn short_timer_fires_and_resumes_the_workflow() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("with-timer", |ctx: WorkflowContext, (): ()| async move {
            ctx.schedule_timer(Duration::from_millis(150)).await?;
            anyhow::Ok("woke".to_string())
        })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "with-timer", ())
        .await
        .unwrap();

    let result = await_result(&backend, &instance.instance_id).await.unwrap();
    assert_eq!(decode::<String>(&result.unwrap()), "woke");
    shutdown.cancel();
}

#[tokio::test]
async fn sub_workflow_result_reaches_the_parent() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("parent", |ctx: WorkflowContext, (): ()| async move {
            let sum: i32 = ctx
                .schedule_sub_workflow(SubWorkflowOptions::default(), "sum", (40i32, 2i32))
                .await?;
            anyhow::Ok(sum)
        })
        .workflow("sum", |_ctx: WorkflowContext, (a, b): (i32, i32)| async move {
            anyhow::Ok(a + b)
        })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "parent", ())
        .await
        .unwrap();

    let result = await_result(&backend, &instance.instance_id).await.unwrap();
    assert_eq!(decode::<i32>(&result.unwrap()), 42);
    shutdown.cancel();
}

#[tokio::test]
async fn cancellation_is_observed_as_canceled_futures() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("long-timer", |ctx: WorkflowContext, (): ()| async move {
            match ctx.schedule_timer(Duration::from_secs(3600)).await {
                Err(e) if e.is_canceled() => anyhow::Ok("canceled".to_string()),
                Err(e) => Err(e.into()),
                Ok(()) => anyhow::Ok("fired".to_string()),
            }
        })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "long-timer", ())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_workflow_instance(&instance.instance_id).await.unwrap();

    let result = await_result(&backend, &instance.instance_id).await.unwrap();
    assert_eq!(decode::<String>(&result.unwrap()), "canceled");
    shutdown.cancel();
}

#[tokio::test]
async fn terminated_instance_records_no_result() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::builder()
        .workflow("await-signal", |ctx: WorkflowContext, (): ()| async move {
            let channel = ctx.signal_channel::<String>("never");
            let _ = channel.receive().await;
            anyhow::Ok(0i32)
        })
        .build();
    let shutdown = start_worker(Arc::clone(&backend), registry);

    let client = Client::new(Arc::clone(&backend));
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "await-signal", ())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.terminate_workflow_instance(&instance.instance_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(backend.workflow_result(&instance.instance_id).is_none());
    let history = backend.history(&instance.instance_id).unwrap();
    assert_eq!(
        history.last().unwrap().event_type(),
        heddle_core::history::EventType::ExecutionTerminated
    );

    // Late signals are rejected.
    let late = client.signal_workflow(&instance.instance_id, "never", &"x").await;
    assert!(late.is_err());
    shutdown.cancel();
}
