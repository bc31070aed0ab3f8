//! Activity invocation: turns an [`ActivityTask`] into a result event.

use crate::registry::Registry;
use chrono::{DateTime, Utc};
use heddle_core::converter::Converter;
use heddle_core::history::{Event, EventAttributes};
use heddle_core::instance::WorkflowInstance;
use heddle_core::task::ActivityTask;
use std::sync::Arc;

/// Context passed to activity functions. Activities are ordinary async code;
/// unlike workflow code they may freely perform I/O, read clocks, and block.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: WorkflowInstance,
    pub task_id: String,
    pub schedule_event_id: u64,
}

/// Invokes registered activity functions and converts their outcome into
/// `ActivityCompleted` / `ActivityFailed` events.
pub struct ActivityExecutor<C: Converter> {
    registry: Arc<Registry<C>>,
}

impl<C: Converter> ActivityExecutor<C> {
    pub fn new(registry: Arc<Registry<C>>) -> Self {
        Self { registry }
    }

    /// Runs the activity named by the task's scheduling event. Every failure
    /// mode, including an unregistered name, becomes a durable
    /// `ActivityFailed` event; the workflow decides what to do with it.
    pub async fn execute(&self, task: &ActivityTask, now: DateTime<Utc>) -> Event {
        let schedule_event_id = task.event.schedule_event_id;
        let (name, inputs) = match &task.event.attributes {
            EventAttributes::ActivityScheduled { name, inputs, .. } => (name.clone(), inputs.clone()),
            other => {
                tracing::error!(
                    task_id = %task.id,
                    event_type = %other.event_type(),
                    "activity task does not carry an ActivityScheduled event"
                );
                return failed_event(now, schedule_event_id, "malformed activity task".to_string());
            }
        };

        let Some(activity_fn) = self.registry.activity(&name) else {
            tracing::error!(task_id = %task.id, activity = %name, "activity not registered");
            return failed_event(now, schedule_event_id, format!("activity not registered: {name}"));
        };

        let ctx = ActivityContext {
            instance: task.instance.clone(),
            task_id: task.id.clone(),
            schedule_event_id,
        };

        tracing::debug!(task_id = %task.id, activity = %name, "executing activity");
        match activity_fn(ctx, inputs).await {
            Ok(result) => Event::new(
                now,
                schedule_event_id,
                EventAttributes::ActivityCompleted { result: Some(result) },
            ),
            Err(error) => {
                tracing::debug!(task_id = %task.id, activity = %name, error = %error, "activity failed");
                failed_event(now, schedule_event_id, error.to_string())
            }
        }
    }
}

pub(crate) fn failed_event(now: DateTime<Utc>, schedule_event_id: u64, reason: String) -> Event {
    Event::new(now, schedule_event_id, EventAttributes::ActivityFailed { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use heddle_core::history::EventType;

    fn task_for(event: Event) -> ActivityTask {
        ActivityTask {
            id: "task-1".to_string(),
            instance: WorkflowInstance::new("i1", "e1"),
            event,
        }
    }

    #[tokio::test]
    async fn success_produces_activity_completed() {
        let registry = Arc::new(
            Registry::builder()
                .activity("double", |_ctx, (a,): (i32,)| async move { anyhow::Ok(a * 2) })
                .build(),
        );
        let converter = *registry.converter();
        let executor = ActivityExecutor::new(registry);

        let scheduled = Event::new(
            Utc::now(),
            3,
            EventAttributes::ActivityScheduled {
                name: "double".to_string(),
                version: String::new(),
                inputs: vec![converter.to_payload(&4i32).unwrap()],
            },
        );
        let event = executor.execute(&task_for(scheduled), Utc::now()).await;

        assert_eq!(event.event_type(), EventType::ActivityCompleted);
        assert_eq!(event.schedule_event_id, 3);
        match event.attributes {
            EventAttributes::ActivityCompleted { result: Some(payload) } => {
                let value: i32 = converter.from_payload(&payload).unwrap();
                assert_eq!(value, 8);
            }
            other => panic!("unexpected attributes: {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_error_produces_activity_failed() {
        let registry = Arc::new(
            Registry::builder()
                .activity("broken", |_ctx, (): ()| async move {
                    Err::<i32, anyhow::Error>(anyhow::anyhow!("database unavailable"))
                })
                .build(),
        );
        let executor = ActivityExecutor::new(registry);

        let scheduled = Event::new(
            Utc::now(),
            1,
            EventAttributes::ActivityScheduled {
                name: "broken".to_string(),
                version: String::new(),
                inputs: vec![],
            },
        );
        let event = executor.execute(&task_for(scheduled), Utc::now()).await;

        match event.attributes {
            EventAttributes::ActivityFailed { reason } => {
                assert_eq!(reason, "database unavailable");
            }
            other => panic!("unexpected attributes: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_activity_fails_durably() {
        let registry = Arc::new(Registry::builder().build());
        let executor = ActivityExecutor::new(registry);

        let scheduled = Event::new(
            Utc::now(),
            1,
            EventAttributes::ActivityScheduled {
                name: "ghost".to_string(),
                version: String::new(),
                inputs: vec![],
            },
        );
        let event = executor.execute(&task_for(scheduled), Utc::now()).await;

        assert_eq!(event.event_type(), EventType::ActivityFailed);
    }
}
