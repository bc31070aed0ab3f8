//! The replay engine.
//!
//! Invoked once per workflow task. Phase one replays committed history:
//! result events resolve in-flight futures, and every schedule event must
//! reconcile against the command the re-run workflow code emits at the same
//! point. Any divergence is a non-determinism error and the task fails with
//! nothing committed. Phase two applies the newly delivered events; commands
//! emitted there are translated into fresh events for the backend to commit.

use crate::registry::Registry;
use crate::sync::scheduler::Scheduler;
use crate::workflow::context::{CancelScope, WorkflowContext};
use crate::workflow::state::WorkflowState;
use heddle_core::clock::Clock;
use heddle_core::command::{Command, CommandAttributes};
use heddle_core::converter::Converter;
use heddle_core::error::WorkflowError;
use heddle_core::history::{Event, EventAttributes, EventType, WorkflowEvent};
use heddle_core::payload::Payload;
use heddle_core::task::WorkflowTask;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Replay diverged from recorded history. Fatal for the task; the
    /// instance stays runnable so an upgraded worker may retry.
    #[error("non-deterministic workflow execution: {0}")]
    NonDeterminism(String),
    /// The delivered history violates the event model.
    #[error("inconsistent history: {0}")]
    History(String),
    #[error("workflow not registered: {0}")]
    WorkflowNotFound(String),
}

/// Outcome of one execution slice.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Events applied or produced this slice, in order. These are what the
    /// backend appends to history.
    pub executed: Vec<Event>,
    /// `ActivityScheduled` events to enqueue as activity tasks.
    pub activity_events: Vec<Event>,
    /// Pending `TimerFired` events, deliverable once `visible_at` passes.
    pub timer_events: Vec<Event>,
    /// Messages to other instances.
    pub workflow_events: Vec<WorkflowEvent>,
    /// Whether the instance reached a terminal state in this slice.
    pub completed: bool,
}

pub struct WorkflowExecutor<C: Converter> {
    registry: Arc<Registry<C>>,
    clock: Arc<dyn Clock>,
}

impl<C: Converter> WorkflowExecutor<C> {
    pub fn new(registry: Arc<Registry<C>>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    pub fn execute_task(&self, task: &WorkflowTask) -> Result<ExecutionResult, ExecutorError> {
        let mut scheduler = Scheduler::new();
        let shared = scheduler.shared();
        let initial_now = task
            .history
            .first()
            .or_else(|| task.new_events.first())
            .map(|e| e.timestamp)
            .unwrap_or_else(|| self.clock.now());
        let state = Rc::new(RefCell::new(WorkflowState::new(task.instance.clone(), initial_now)));
        let scope = CancelScope::new(Rc::clone(&shared));
        let ctx = WorkflowContext::new(
            Rc::clone(&state),
            Rc::clone(&shared),
            self.registry.converter().clone(),
            Rc::clone(&scope),
        );

        state.borrow_mut().set_replaying(true);
        for event in &task.history {
            self.apply_event(&mut scheduler, &state, &ctx, &scope, event)?;
        }
        let unmatched = state
            .borrow()
            .unmatched_replay_command()
            .map(|c| format!("{:?}#{}", c.command_type(), c.id));
        if let Some(command) = unmatched {
            return Err(ExecutorError::NonDeterminism(format!(
                "command {command} emitted during replay has no schedule event in history"
            )));
        }

        state.borrow_mut().set_replaying(false);
        let mut result = ExecutionResult::default();
        for event in &task.new_events {
            self.apply_event(&mut scheduler, &state, &ctx, &scope, event)?;
            if event.event_type() == EventType::ExecutionTerminated {
                result.completed = true;
            }
            result.executed.push(event.clone());
        }
        scheduler.run_until_blocked();

        let now = self.clock.now();
        let mut st = state.borrow_mut();
        // Completion is translated after everything else so the terminal
        // event lands last in history, even when coroutines abandoned at
        // workflow completion still emitted commands.
        let is_completion =
            |c: &Command| matches!(c.attributes, CommandAttributes::CompleteWorkflow { .. });
        for command in st.commands_mut().iter_mut().filter(|c| !is_completion(c)) {
            let command_result = command.execute(now, &task.instance);
            result.executed.extend(command_result.events);
            result.activity_events.extend(command_result.activity_events);
            result.timer_events.extend(command_result.timer_events);
            result.workflow_events.extend(command_result.workflow_events);
        }
        for command in st.commands_mut().iter_mut().filter(|c| is_completion(c)) {
            let command_result = command.execute(now, &task.instance);
            result.executed.extend(command_result.events);
            result.workflow_events.extend(command_result.workflow_events);
            result.completed |= command_result.completed;
        }
        result.workflow_events.extend(st.take_messages());
        drop(st);

        tracing::debug!(
            instance_id = %task.instance.instance_id,
            executed = result.executed.len(),
            completed = result.completed,
            "executed workflow task"
        );
        Ok(result)
    }

    fn apply_event(
        &self,
        scheduler: &mut Scheduler,
        state: &Rc<RefCell<WorkflowState>>,
        ctx: &WorkflowContext<C>,
        scope: &Rc<CancelScope>,
        event: &Event,
    ) -> Result<(), ExecutorError> {
        tracing::trace!(
            event_type = %event.event_type(),
            schedule_event_id = event.schedule_event_id,
            "applying event"
        );

        match &event.attributes {
            EventAttributes::ExecutionStarted { name, inputs, .. } => {
                {
                    let mut st = state.borrow_mut();
                    st.set_now(event.timestamp);
                    if !st.mark_started() {
                        return Err(ExecutorError::History(
                            "duplicate ExecutionStarted event".to_string(),
                        ));
                    }
                }
                let Some(workflow_fn) = self.registry.workflow(name) else {
                    return Err(ExecutorError::WorkflowNotFound(name.clone()));
                };
                let ctx = ctx.clone();
                let state = Rc::clone(state);
                let inputs = inputs.clone();
                scheduler.spawn(async move {
                    let result = workflow_fn(ctx, inputs).await;
                    let (result, error) = match result {
                        Ok(payload) => (Some(payload), None),
                        Err(e) => (None, Some(e.to_string())),
                    };
                    let mut st = state.borrow_mut();
                    let id = st.allocate_command_id();
                    st.push_command(Command::new(
                        id,
                        CommandAttributes::CompleteWorkflow { result, error },
                    ));
                });
            }

            EventAttributes::ActivityScheduled { .. }
            | EventAttributes::TimerScheduled { .. }
            | EventAttributes::TimerCanceled
            | EventAttributes::SubWorkflowScheduled { .. }
            | EventAttributes::ExecutionCompleted { .. } => {
                self.match_event(state, event)?;
            }

            EventAttributes::SideEffectResult { result } => {
                self.match_event(state, event)?;
                state
                    .borrow_mut()
                    .resolve_future(event.schedule_event_id, Ok(result.clone()));
            }

            EventAttributes::ActivityCompleted { result } => {
                self.resolve(state, event, Ok(result.clone().unwrap_or_default()))?;
            }
            EventAttributes::ActivityFailed { reason } => {
                self.resolve(state, event, Err(WorkflowError::failure(reason.clone())))?;
            }
            EventAttributes::SubWorkflowCompleted { result } => {
                self.resolve(state, event, Ok(result.clone().unwrap_or_default()))?;
            }
            EventAttributes::SubWorkflowFailed { reason } => {
                self.resolve(state, event, Err(WorkflowError::failure(reason.clone())))?;
            }

            EventAttributes::TimerFired { at } => {
                let mut st = state.borrow_mut();
                st.set_now(*at);
                if !st.resolve_future(event.schedule_event_id, Ok(Payload::default())) {
                    return Err(ExecutorError::History(format!(
                        "TimerFired#{} references no in-flight timer",
                        event.schedule_event_id
                    )));
                }
            }

            EventAttributes::SignalReceived { name, arg } => {
                let channel = {
                    let mut st = state.borrow_mut();
                    st.set_now(event.timestamp);
                    st.signal_channel(name, ctx.scheduler_shared())
                };
                channel.send(arg.clone().unwrap_or_default());
            }

            EventAttributes::ExecutionCanceled
            | EventAttributes::SubWorkflowCancellationRequested => {
                state.borrow_mut().set_now(event.timestamp);
                CancelScope::cancel(scope, state);
            }

            EventAttributes::ExecutionTerminated => {
                // Forced stop: no workflow code runs for this event.
            }
        }

        scheduler.run_until_blocked();
        Ok(())
    }

    fn match_event(
        &self,
        state: &Rc<RefCell<WorkflowState>>,
        event: &Event,
    ) -> Result<(), ExecutorError> {
        let mut st = state.borrow_mut();
        if !st.is_replaying() {
            return Err(ExecutorError::History(format!(
                "schedule event {} delivered as a new event",
                event.event_type()
            )));
        }
        st.match_schedule_event(event).map_err(ExecutorError::NonDeterminism)
    }

    fn resolve(
        &self,
        state: &Rc<RefCell<WorkflowState>>,
        event: &Event,
        result: Result<Payload, WorkflowError>,
    ) -> Result<(), ExecutorError> {
        let mut st = state.borrow_mut();
        st.set_now(event.timestamp);
        if !st.resolve_future(event.schedule_event_id, result) {
            return Err(ExecutorError::History(format!(
                "result event {}#{} references no schedule event",
                event.event_type(),
                event.schedule_event_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::options::ActivityOptions;
    use chrono::Utc;
    use heddle_core::clock::MockClock;
    use heddle_core::converter::JsonConverter;
    use heddle_core::instance::WorkflowInstance;
    use heddle_core::task::{WorkflowMetadata, WorkflowTask};

    fn executor(registry: Registry<JsonConverter>) -> (WorkflowExecutor<JsonConverter>, MockClock) {
        let clock = MockClock::new(Utc::now());
        (
            WorkflowExecutor::new(Arc::new(registry), Arc::new(clock.clone())),
            clock,
        )
    }

    fn task(history: Vec<Event>, new_events: Vec<Event>) -> WorkflowTask {
        WorkflowTask {
            instance: WorkflowInstance::new("i1", "e1"),
            metadata: WorkflowMetadata::default(),
            last_sequence_id: history.last().map_or(0, |e| e.sequence_id),
            history,
            new_events,
        }
    }

    fn started(now: chrono::DateTime<Utc>, name: &str) -> Event {
        Event::new(
            now,
            0,
            EventAttributes::ExecutionStarted {
                name: name.to_string(),
                version: String::new(),
                inputs: vec![],
            },
        )
    }

    #[test]
    fn workflow_without_suspensions_completes_in_one_slice() {
        let registry = Registry::builder()
            .workflow("hello", |_ctx, (): ()| async move { anyhow::Ok(0i32) })
            .build();
        let (executor, clock) = executor(registry);

        let result = executor
            .execute_task(&task(vec![], vec![started(clock.now(), "hello")]))
            .unwrap();

        assert!(result.completed);
        assert_eq!(result.executed.len(), 2);
        assert_eq!(result.executed[0].event_type(), EventType::ExecutionStarted);
        assert_eq!(result.executed[1].event_type(), EventType::ExecutionCompleted);
        match &result.executed[1].attributes {
            EventAttributes::ExecutionCompleted { result: Some(payload), error: None } => {
                let value: i32 = JsonConverter.from_payload(payload).unwrap();
                assert_eq!(value, 0);
            }
            other => panic!("unexpected attributes: {other:?}"),
        }
    }

    #[test]
    fn replay_after_commit_is_quiescent() {
        let registry = Registry::builder()
            .workflow("with-activity", |ctx: WorkflowContext, (): ()| async move {
                let value: i32 = ctx
                    .schedule_activity(ActivityOptions::default(), "compute", ())
                    .await?;
                anyhow::Ok(value)
            })
            .build();
        let (executor, clock) = executor(registry);

        let first = executor
            .execute_task(&task(vec![], vec![started(clock.now(), "with-activity")]))
            .unwrap();
        assert!(!first.completed);
        assert_eq!(first.activity_events.len(), 1);

        let second = executor.execute_task(&task(first.executed, vec![])).unwrap();
        assert!(second.executed.is_empty());
        assert!(second.activity_events.is_empty());
        assert!(!second.completed);
    }

    #[test]
    fn identical_history_emits_identical_commands() {
        let registry = Registry::builder()
            .workflow("two-activities", |ctx: WorkflowContext, (): ()| async move {
                let a: i32 = ctx
                    .schedule_activity(ActivityOptions::default(), "first", ())
                    .await?;
                let b: i32 = ctx
                    .schedule_activity(ActivityOptions::default(), "second", (a,))
                    .await?;
                anyhow::Ok(b)
            })
            .build();
        let (executor, clock) = executor(registry);

        let slice = task(vec![], vec![started(clock.now(), "two-activities")]);
        let first = executor.execute_task(&slice).unwrap();
        let second = executor.execute_task(&slice).unwrap();

        let kinds = |result: &ExecutionResult| {
            result
                .executed
                .iter()
                .map(|e| (e.event_type(), e.schedule_event_id))
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(&first), kinds(&second));
    }

    #[test]
    fn activity_result_resumes_the_workflow() {
        let registry = Registry::builder()
            .workflow("with-activity", |ctx: WorkflowContext, (): ()| async move {
                let value: i32 = ctx
                    .schedule_activity(ActivityOptions::default(), "compute", ())
                    .await?;
                anyhow::Ok(value)
            })
            .build();
        let (executor, clock) = executor(registry);

        let first = executor
            .execute_task(&task(vec![], vec![started(clock.now(), "with-activity")]))
            .unwrap();

        let completion = Event::new(
            clock.now(),
            first.activity_events[0].schedule_event_id,
            EventAttributes::ActivityCompleted {
                result: Some(JsonConverter.to_payload(&23i32).unwrap()),
            },
        );
        let second = executor
            .execute_task(&task(first.executed, vec![completion]))
            .unwrap();

        assert!(second.completed);
        let finished = second
            .executed
            .iter()
            .find(|e| e.event_type() == EventType::ExecutionCompleted)
            .unwrap();
        match &finished.attributes {
            EventAttributes::ExecutionCompleted { result: Some(payload), error: None } => {
                let value: i32 = JsonConverter.from_payload(payload).unwrap();
                assert_eq!(value, 23);
            }
            other => panic!("unexpected attributes: {other:?}"),
        }
    }

    #[test]
    fn diverging_replay_is_a_non_determinism_error() {
        let registry = Registry::builder()
            .workflow("with-activity", |ctx: WorkflowContext, (): ()| async move {
                let value: i32 = ctx
                    .schedule_activity(ActivityOptions::default(), "compute", ())
                    .await?;
                anyhow::Ok(value)
            })
            .build();
        let (executor, clock) = executor(registry);

        // History claims a timer was scheduled where the code schedules an
        // activity.
        let history = vec![
            started(clock.now(), "with-activity"),
            Event::new(clock.now(), 1, EventAttributes::TimerScheduled { at: clock.now() }),
        ];
        let result = executor.execute_task(&task(history, vec![]));

        assert!(matches!(result, Err(ExecutorError::NonDeterminism(_))));
    }

    #[test]
    fn surplus_replay_command_is_a_non_determinism_error() {
        let registry = Registry::builder()
            .workflow("with-activity", |ctx: WorkflowContext, (): ()| async move {
                let value: i32 = ctx
                    .schedule_activity(ActivityOptions::default(), "compute", ())
                    .await?;
                anyhow::Ok(value)
            })
            .build();
        let (executor, clock) = executor(registry);

        // History ends before the activity the code schedules.
        let history = vec![started(clock.now(), "with-activity")];
        let result = executor.execute_task(&task(history, vec![]));

        assert!(matches!(result, Err(ExecutorError::NonDeterminism(_))));
    }

    #[test]
    fn result_event_without_a_schedule_event_is_rejected() {
        let registry = Registry::builder()
            .workflow("hello", |_ctx, (): ()| async move { anyhow::Ok(0i32) })
            .build();
        let (executor, clock) = executor(registry);

        let orphan = Event::new(
            clock.now(),
            9,
            EventAttributes::ActivityCompleted { result: None },
        );
        let result = executor.execute_task(&task(vec![], vec![started(clock.now(), "hello"), orphan]));

        assert!(matches!(result, Err(ExecutorError::History(_))));
    }

    #[test]
    fn schedule_event_delivered_as_new_is_rejected() {
        let registry = Registry::builder()
            .workflow("hello", |_ctx, (): ()| async move { anyhow::Ok(0i32) })
            .build();
        let (executor, clock) = executor(registry);

        let stray = Event::new(clock.now(), 1, EventAttributes::TimerScheduled { at: clock.now() });
        let result = executor.execute_task(&task(vec![], vec![started(clock.now(), "hello"), stray]));

        assert!(matches!(result, Err(ExecutorError::History(_))));
    }

    #[test]
    fn side_effect_runs_once_and_replays_from_history() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let registry = Registry::builder()
            .workflow("with-side-effect", |ctx: WorkflowContext, (): ()| async move {
                let value: u32 = ctx
                    .side_effect(|| {
                        CALLS.fetch_add(1, Ordering::SeqCst);
                        7u32
                    })
                    .await?;
                anyhow::Ok(value)
            })
            .build();
        let (executor, clock) = executor(registry);

        let first = executor
            .execute_task(&task(vec![], vec![started(clock.now(), "with-side-effect")]))
            .unwrap();
        assert!(first.completed);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(first
            .executed
            .iter()
            .any(|e| e.event_type() == EventType::SideEffectResult));

        // Replaying the committed slice must not run the closure again.
        let second = executor.execute_task(&task(first.executed, vec![])).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(second.executed.is_empty());
    }

    #[test]
    fn signal_resumes_a_blocked_workflow() {
        let registry = Registry::builder()
            .workflow("await-signal", |ctx: WorkflowContext, (): ()| async move {
                let channel = ctx.signal_channel::<String>("go");
                let value = channel.receive().await.unwrap_or_default();
                anyhow::Ok(value)
            })
            .build();
        let (executor, clock) = executor(registry);

        let first = executor
            .execute_task(&task(vec![], vec![started(clock.now(), "await-signal")]))
            .unwrap();
        assert!(!first.completed);
        // Idle while blocked on the signal: no commands at all.
        assert_eq!(first.executed.len(), 1);

        let signal = Event::new(
            clock.now(),
            0,
            EventAttributes::SignalReceived {
                name: "go".to_string(),
                arg: Some(JsonConverter.to_payload("s42").unwrap()),
            },
        );
        let second = executor
            .execute_task(&task(first.executed, vec![signal]))
            .unwrap();

        assert!(second.completed);
    }

    #[test]
    fn cancellation_rejects_pending_futures() {
        let registry = Registry::builder()
            .workflow("cancelable", |ctx: WorkflowContext, (): ()| async move {
                let timer = ctx.schedule_timer(std::time::Duration::from_secs(300));
                match timer.await {
                    Err(e) if e.is_canceled() => anyhow::Ok("canceled".to_string()),
                    other => anyhow::Ok(format!("unexpected: {other:?}")),
                }
            })
            .build();
        let (executor, clock) = executor(registry);

        let first = executor
            .execute_task(&task(vec![], vec![started(clock.now(), "cancelable")]))
            .unwrap();
        assert!(!first.completed);

        let canceled = Event::new(clock.now(), 0, EventAttributes::ExecutionCanceled);
        let second = executor
            .execute_task(&task(first.executed, vec![canceled]))
            .unwrap();

        assert!(second.completed);
        let finished = second
            .executed
            .iter()
            .find(|e| e.event_type() == EventType::ExecutionCompleted)
            .unwrap();
        match &finished.attributes {
            EventAttributes::ExecutionCompleted { result: Some(payload), error: None } => {
                let value: String = JsonConverter.from_payload(payload).unwrap();
                assert_eq!(value, "canceled");
            }
            other => panic!("unexpected attributes: {other:?}"),
        }
    }
}
