//! Single-process test harness for workflows.
//!
//! Drives the workflow under test (and any sub-workflows it spawns)
//! entirely in-process against a mock clock. Activities run inline, either
//! through their registered implementation or through expectation mocks.
//! Time never passes on its own: when no instance has deliverable events,
//! the harness advances the clock to the earliest due timer or scheduled
//! callback. A workflow that can make no progress at all is reported as
//! blocked.

use crate::activity::ActivityExecutor;
use crate::registry::Registry;
use crate::workflow::executor::WorkflowExecutor;
use chrono::{DateTime, Utc};
use heddle_core::clock::{Clock, MockClock};
use heddle_core::converter::{Converter, IntoPayloads, JsonConverter};
use heddle_core::history::{Event, EventAttributes, EventType, WorkflowEvent};
use heddle_core::instance::WorkflowInstance;
use heddle_core::payload::Payload;
use heddle_core::task::{ActivityTask, WorkflowMetadata, WorkflowTask};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct TestWorkflowState {
    instance: WorkflowInstance,
    history: Vec<Event>,
    pending: Vec<Event>,
    next_sequence_id: i64,
    completed: bool,
}

impl TestWorkflowState {
    fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            history: Vec::new(),
            pending: Vec::new(),
            next_sequence_id: 1,
            completed: false,
        }
    }

    fn has_started(&self) -> bool {
        self.history
            .iter()
            .chain(self.pending.iter())
            .any(|e| e.event_type() == EventType::ExecutionStarted)
    }
}

enum TimerAction<C: Converter> {
    Deliver { instance_id: String, event: Event },
    Callback(Box<dyn FnOnce(&mut TesterCore<C>)>),
}

struct TestTimer<C: Converter> {
    at: DateTime<Utc>,
    seq: u64,
    action: TimerAction<C>,
}

/// The routable surface of the harness, handed to scheduled callbacks and
/// the sub-workflow listener so they can inject events mid-run.
pub struct TesterCore<C: Converter> {
    converter: C,
    clock: MockClock,
    root: WorkflowInstance,
    workflows: Vec<TestWorkflowState>,
    timers: Vec<TestTimer<C>>,
    timer_seq: u64,
}

impl<C: Converter> TesterCore<C> {
    /// Current workflow time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Signals the workflow under test.
    pub fn signal_workflow(&mut self, name: &str, value: &impl Serialize) {
        let instance_id = self.root.instance_id.clone();
        self.signal_workflow_instance(&instance_id, name, value);
    }

    /// Signals an arbitrary instance, e.g. a sub-workflow.
    pub fn signal_workflow_instance(
        &mut self,
        instance_id: &str,
        name: &str,
        value: &impl Serialize,
    ) {
        let payload = self
            .converter
            .to_payload(value)
            .expect("failed to encode signal value");
        let event = Event::new(
            self.clock.now(),
            0,
            EventAttributes::SignalReceived { name: name.to_string(), arg: Some(payload) },
        );
        self.deliver_to(instance_id, event);
    }

    fn deliver_to(&mut self, instance_id: &str, event: Event) {
        match self.workflows.iter_mut().find(|w| w.instance.instance_id == instance_id) {
            Some(state) => {
                if state.completed {
                    tracing::debug!(instance_id, "dropping event for finished test instance");
                    return;
                }
                state.pending.push(event);
            }
            None => {
                let instance = WorkflowInstance::new(instance_id, Uuid::new_v4().to_string());
                let mut state = TestWorkflowState::new(instance);
                state.pending.push(event);
                self.workflows.push(state);
            }
        }
    }

    fn deliver_instance(&mut self, instance: WorkflowInstance, event: Event) {
        match self
            .workflows
            .iter_mut()
            .find(|w| w.instance.instance_id == instance.instance_id)
        {
            Some(state) => {
                if event.event_type() == EventType::ExecutionStarted {
                    if state.has_started() {
                        tracing::debug!(
                            instance_id = %instance.instance_id,
                            "dropping duplicate start message"
                        );
                        return;
                    }
                    // A signal may have created the entry before the start
                    // message arrived; adopt the real identity.
                    state.instance = instance;
                }
                if state.completed {
                    return;
                }
                state.pending.push(event);
            }
            None => {
                let mut state = TestWorkflowState::new(instance);
                state.pending.push(event);
                self.workflows.push(state);
            }
        }
    }

    fn schedule_timer(&mut self, at: DateTime<Utc>, action: TimerAction<C>) {
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.push(TestTimer { at, seq, action });
    }

    fn pop_earliest_timer(&mut self) -> Option<TestTimer<C>> {
        if self.timers.is_empty() {
            return None;
        }
        let mut earliest = 0;
        for (index, timer) in self.timers.iter().enumerate().skip(1) {
            let best = &self.timers[earliest];
            if (timer.at, timer.seq) < (best.at, best.seq) {
                earliest = index;
            }
        }
        Some(self.timers.remove(earliest))
    }

    fn ready_index(&self) -> Option<usize> {
        self.workflows
            .iter()
            .position(|w| !w.completed && !w.pending.is_empty() && w.has_started())
    }

    fn take_task(&mut self, index: usize) -> WorkflowTask {
        let state = &mut self.workflows[index];
        WorkflowTask {
            instance: state.instance.clone(),
            metadata: WorkflowMetadata::default(),
            last_sequence_id: state.history.last().map_or(0, |e| e.sequence_id),
            history: state.history.clone(),
            new_events: std::mem::take(&mut state.pending),
        }
    }

    fn commit(&mut self, index: usize, executed: &[Event]) {
        let mut canceled_timers = Vec::new();
        {
            let state = &mut self.workflows[index];
            for event in executed {
                let mut event = event.clone();
                event.sequence_id = state.next_sequence_id;
                state.next_sequence_id += 1;
                if event.is_terminal() {
                    state.completed = true;
                }
                if event.event_type() == EventType::TimerCanceled {
                    canceled_timers.push(event.schedule_event_id);
                }
                state.history.push(event);
            }
        }

        // A canceled timer's fired event becomes undeliverable, exactly as
        // a backend drops it.
        if !canceled_timers.is_empty() {
            let instance_id = self.workflows[index].instance.instance_id.clone();
            self.timers.retain(|timer| match &timer.action {
                TimerAction::Deliver { instance_id: target, event } => {
                    !(*target == instance_id
                        && event.event_type() == EventType::TimerFired
                        && canceled_timers.contains(&event.schedule_event_id))
                }
                TimerAction::Callback(_) => true,
            });
        }
    }
}

#[derive(Clone)]
enum MockOutcome {
    Value(Payload),
    Error(String),
}

struct MockResponse {
    remaining: Option<u32>,
    outcome: MockOutcome,
}

fn take_mock_response(responses: &mut [MockResponse]) -> Option<MockOutcome> {
    for response in responses.iter_mut() {
        match &mut response.remaining {
            Some(0) => continue,
            Some(n) => {
                *n -= 1;
                return Some(response.outcome.clone());
            }
            None => return Some(response.outcome.clone()),
        }
    }
    None
}

/// One expectation being configured. Responses are consumed in registration
/// order; an entry without a call count stays in effect indefinitely.
pub struct MockCall<'a, C: Converter> {
    responses: &'a mut Vec<MockResponse>,
    converter: C,
    times: Option<u32>,
}

impl<C: Converter> MockCall<'_, C> {
    /// Limits this response to a single call.
    #[must_use]
    pub fn once(mut self) -> Self {
        self.times = Some(1);
        self
    }

    /// Limits this response to `n` calls.
    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.times = Some(n);
        self
    }

    /// The mocked call succeeds with `value`.
    pub fn returns(self, value: &impl Serialize) {
        let payload = self
            .converter
            .to_payload(value)
            .expect("failed to encode mock return value");
        self.responses
            .push(MockResponse { remaining: self.times, outcome: MockOutcome::Value(payload) });
    }

    /// The mocked call fails with `reason`.
    pub fn fails(self, reason: &str) {
        self.responses.push(MockResponse {
            remaining: self.times,
            outcome: MockOutcome::Error(reason.to_string()),
        });
    }
}

type SubWorkflowListener<C> = Box<dyn FnMut(&mut TesterCore<C>, &WorkflowInstance, &str)>;

/// Harness for one workflow under test.
pub struct WorkflowTester<R, C: Converter = JsonConverter> {
    workflow_name: String,
    registry: Registry<C>,
    converter: C,
    clock: MockClock,
    core: TesterCore<C>,
    activity_mocks: HashMap<String, Vec<MockResponse>>,
    workflow_mocks: HashMap<String, Vec<MockResponse>>,
    sub_workflow_listener: Option<SubWorkflowListener<C>>,
    finished: bool,
    result: Option<Payload>,
    error: Option<String>,
    _marker: PhantomData<fn() -> R>,
}

impl<R, C: Converter> WorkflowTester<R, C> {
    /// Creates a tester for the named workflow, which must be registered in
    /// `registry` along with any unmocked activities and sub-workflows it
    /// uses.
    pub fn new(registry: Registry<C>, workflow_name: &str) -> Self {
        let clock = MockClock::new(Utc::now());
        let converter = registry.converter().clone();
        let root = WorkflowInstance::new(Uuid::new_v4().to_string(), Uuid::new_v4().to_string());
        Self {
            workflow_name: workflow_name.to_string(),
            registry,
            converter: converter.clone(),
            clock: clock.clone(),
            core: TesterCore {
                converter,
                clock,
                root,
                workflows: Vec::new(),
                timers: Vec::new(),
                timer_seq: 0,
            },
            activity_mocks: HashMap::new(),
            workflow_mocks: HashMap::new(),
            sub_workflow_listener: None,
            finished: false,
            result: None,
            error: None,
            _marker: PhantomData,
        }
    }

    /// Current workflow time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Instance under test.
    pub fn instance(&self) -> &WorkflowInstance {
        &self.core.root
    }

    /// Configures a response for a (possibly unregistered) activity. Once an
    /// activity is mocked, its registered implementation is never called.
    pub fn on_activity(&mut self, name: &str) -> MockCall<'_, C> {
        MockCall {
            responses: self.activity_mocks.entry(name.to_string()).or_default(),
            converter: self.converter.clone(),
            times: None,
        }
    }

    /// Configures a response for a sub-workflow by name.
    pub fn on_sub_workflow(&mut self, name: &str) -> MockCall<'_, C> {
        MockCall {
            responses: self.workflow_mocks.entry(name.to_string()).or_default(),
            converter: self.converter.clone(),
            times: None,
        }
    }

    /// Registers a listener invoked whenever a sub-workflow is started.
    pub fn listen_sub_workflow(
        &mut self,
        listener: impl FnMut(&mut TesterCore<C>, &WorkflowInstance, &str) + 'static,
    ) {
        self.sub_workflow_listener = Some(Box::new(listener));
    }

    /// Signals the workflow under test before or between execution steps.
    pub fn signal_workflow(&mut self, name: &str, value: &impl Serialize) {
        self.core.signal_workflow(name, value);
    }

    /// Schedules `callback` to run after `delay` of workflow time (not wall
    /// clock). The callback receives the routable core, e.g. to signal.
    pub fn schedule_callback(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut TesterCore<C>) + 'static,
    ) {
        let at = self.clock.now()
            + chrono::Duration::from_std(delay).expect("callback delay out of range");
        self.core.schedule_timer(at, TimerAction::Callback(Box::new(callback)));
    }

    /// Runs the workflow to completion, advancing the mock clock as needed.
    ///
    /// # Panics
    ///
    /// Panics when execution fails (e.g. non-determinism), when a mock runs
    /// out of responses, when an activity is neither registered nor mocked,
    /// or when the workflow blocks with no way to make progress.
    pub async fn execute(&mut self, args: impl IntoPayloads) {
        let inputs = args
            .into_payloads(&self.converter)
            .expect("failed to encode workflow inputs");
        let started = Event::new(
            self.clock.now(),
            0,
            EventAttributes::ExecutionStarted {
                name: self.workflow_name.clone(),
                version: String::new(),
                inputs,
            },
        );
        let root = self.core.root.clone();
        self.core.deliver_instance(root, started);

        let registry = Arc::new(self.registry.clone());
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let executor = WorkflowExecutor::new(Arc::clone(&registry), clock);
        let activity_executor = ActivityExecutor::new(registry);

        while !self.finished {
            match self.core.ready_index() {
                Some(index) => {
                    let task = self.core.take_task(index);
                    let result = match executor.execute_task(&task) {
                        Ok(result) => result,
                        Err(e) => panic!("workflow execution failed: {e}"),
                    };

                    self.core.commit(index, &result.executed);
                    self.record_completion(&task.instance, &result.executed);

                    for event in &result.activity_events {
                        self.dispatch_activity(&activity_executor, &task.instance, event).await;
                    }
                    for message in result.workflow_events {
                        self.route_message(message);
                    }
                    for event in result.timer_events {
                        let at = event
                            .visible_at
                            .expect("timer event without a visibility barrier");
                        self.core.schedule_timer(
                            at,
                            TimerAction::Deliver {
                                instance_id: task.instance.instance_id.clone(),
                                event,
                            },
                        );
                    }
                }
                None => match self.core.pop_earliest_timer() {
                    Some(timer) => {
                        if timer.at > self.clock.now() {
                            self.clock.set(timer.at);
                        }
                        match timer.action {
                            TimerAction::Deliver { instance_id, event } => {
                                self.core.deliver_to(&instance_id, event);
                            }
                            TimerAction::Callback(callback) => callback(&mut self.core),
                        }
                    }
                    None => panic!(
                        "workflow '{}' blocked: no deliverable events, timers or callbacks",
                        self.workflow_name
                    ),
                },
            }
        }
    }

    /// Whether the workflow under test reached a terminal state.
    pub fn workflow_finished(&self) -> bool {
        self.finished
    }

    /// Result and error of the finished workflow. The result decodes to
    /// `R::default()` when the workflow failed.
    pub fn workflow_result(&self) -> (R, Option<String>)
    where
        R: DeserializeOwned + Default,
    {
        assert!(self.finished, "workflow has not finished");
        let value = match (&self.result, &self.error) {
            (Some(payload), None) => self
                .converter
                .from_payload(payload)
                .expect("failed to decode workflow result"),
            _ => R::default(),
        };
        (value, self.error.clone())
    }

    /// Committed history of the workflow under test.
    pub fn history(&self) -> &[Event] {
        self.history_of(&self.core.root.instance_id).unwrap_or(&[])
    }

    /// Committed history of any instance the harness has seen.
    pub fn history_of(&self, instance_id: &str) -> Option<&[Event]> {
        self.core
            .workflows
            .iter()
            .find(|w| w.instance.instance_id == instance_id)
            .map(|w| w.history.as_slice())
    }

    /// Panics if any call-count-limited mock response was not fully
    /// consumed.
    pub fn assert_expectations(&self) {
        for (name, responses) in self.activity_mocks.iter().chain(self.workflow_mocks.iter()) {
            for response in responses {
                if let Some(remaining) = response.remaining {
                    assert!(
                        remaining == 0,
                        "expected {remaining} more call(s) to mock '{name}'"
                    );
                }
            }
        }
    }

    fn record_completion(&mut self, instance: &WorkflowInstance, executed: &[Event]) {
        if instance.instance_id != self.core.root.instance_id {
            return;
        }
        for event in executed {
            if let EventAttributes::ExecutionCompleted { result, error } = &event.attributes {
                self.finished = true;
                self.result = result.clone();
                self.error = error.clone();
            }
        }
    }

    async fn dispatch_activity(
        &mut self,
        executor: &ActivityExecutor<C>,
        instance: &WorkflowInstance,
        event: &Event,
    ) {
        let EventAttributes::ActivityScheduled { name, .. } = &event.attributes else {
            return;
        };
        let name = name.clone();

        let completion = if let Some(responses) = self.activity_mocks.get_mut(&name) {
            let outcome = take_mock_response(responses)
                .unwrap_or_else(|| panic!("no mock responses left for activity '{name}'"));
            match outcome {
                MockOutcome::Value(payload) => Event::new(
                    self.clock.now(),
                    event.schedule_event_id,
                    EventAttributes::ActivityCompleted { result: Some(payload) },
                ),
                MockOutcome::Error(reason) => Event::new(
                    self.clock.now(),
                    event.schedule_event_id,
                    EventAttributes::ActivityFailed { reason },
                ),
            }
        } else if self.registry.has_activity(&name) {
            let task = ActivityTask {
                id: Uuid::new_v4().to_string(),
                instance: instance.clone(),
                event: event.clone(),
            };
            executor.execute(&task, self.clock.now()).await
        } else {
            panic!("activity '{name}' is neither registered nor mocked");
        };

        self.core.deliver_to(&instance.instance_id, completion);
    }

    fn route_message(&mut self, message: WorkflowEvent) {
        match &message.event.attributes {
            EventAttributes::ExecutionStarted { name, .. } => {
                let name = name.clone();
                if let Some(listener) = self.sub_workflow_listener.as_mut() {
                    listener(&mut self.core, &message.instance, &name);
                }
                if let Some(responses) = self.workflow_mocks.get_mut(&name) {
                    let outcome = take_mock_response(responses)
                        .unwrap_or_else(|| panic!("no mock responses left for sub-workflow '{name}'"));
                    let parent = message
                        .instance
                        .parent
                        .clone()
                        .expect("sub-workflow start message without a parent reference");
                    let event = match outcome {
                        MockOutcome::Value(payload) => Event::new(
                            self.clock.now(),
                            parent.schedule_event_id,
                            EventAttributes::SubWorkflowCompleted { result: Some(payload) },
                        ),
                        MockOutcome::Error(reason) => Event::new(
                            self.clock.now(),
                            parent.schedule_event_id,
                            EventAttributes::SubWorkflowFailed { reason },
                        ),
                    };
                    self.core.deliver_to(&parent.instance_id, event);
                } else {
                    self.core.deliver_instance(message.instance, message.event);
                }
            }
            _ => self.core.deliver_instance(message.instance, message.event),
        }
    }
}
