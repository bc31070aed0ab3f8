//! In-memory implementation of [`Backend`].
//!
//! Reference implementation and test backend: everything lives under one
//! mutex, so every contract operation is trivially atomic. Leases are
//! reclaimed on expiry, which makes worker-crash scenarios reproducible with
//! a [`MockClock`].

use crate::backend::{Backend, BackendError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use heddle_core::clock::{Clock, WallClock};
use heddle_core::history::{Event, EventType, WorkflowEvent};
use heddle_core::instance::WorkflowInstance;
use heddle_core::payload::Payload;
use heddle_core::task::{ActivityTask, WorkflowMetadata, WorkflowTask};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

struct WorkflowLease {
    expires_at: DateTime<Utc>,
    /// Events handed out with the task; requeued if the lease expires.
    dispatched: Vec<Event>,
}

struct InstanceState {
    instance: WorkflowInstance,
    history: Vec<Event>,
    pending_events: Vec<Event>,
    next_sequence_id: i64,
    /// An `ExecutionStarted` event has been seen. Instances that exist only
    /// because a signal raced ahead of their start message stay dormant.
    started: bool,
    completed: bool,
    lease: Option<WorkflowLease>,
}

impl InstanceState {
    fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            history: Vec::new(),
            pending_events: Vec::new(),
            next_sequence_id: 1,
            started: false,
            completed: false,
            lease: None,
        }
    }
}

struct ActivityLease {
    task: ActivityTask,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, InstanceState>,
    activity_queue: VecDeque<ActivityTask>,
    activity_leases: HashMap<String, ActivityLease>,
}

#[derive(Clone)]
pub struct InMemoryBackend {
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(WallClock),
            lease_duration: Duration::seconds(30),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BackendError> {
        self.inner
            .lock()
            .map_err(|e| BackendError::Other(format!("lock poisoned: {e}")))
    }

    /// Committed history of an instance, for inspection in tests.
    pub fn history(&self, instance_id: &str) -> Option<Vec<Event>> {
        let inner = self.inner.lock().ok()?;
        inner.instances.get(instance_id).map(|s| s.history.clone())
    }

    /// Result of a finished instance: `None` while running, otherwise the
    /// recorded result or error string.
    pub fn workflow_result(&self, instance_id: &str) -> Option<Result<Option<Payload>, String>> {
        let inner = self.inner.lock().ok()?;
        let state = inner.instances.get(instance_id)?;
        state.history.iter().find_map(|e| match &e.attributes {
            heddle_core::history::EventAttributes::ExecutionCompleted { result, error } => {
                match error {
                    Some(err) => Some(Err(err.clone())),
                    None => Some(Ok(result.clone())),
                }
            }
            _ => None,
        })
    }

    fn append_history(state: &mut InstanceState, mut event: Event) -> Result<(), BackendError> {
        if state.completed {
            return Err(BackendError::InstanceFinished(
                state.instance.instance_id.clone(),
            ));
        }
        event.sequence_id = state.next_sequence_id;
        state.next_sequence_id += 1;
        if event.is_terminal() {
            state.completed = true;
        }
        if event.event_type() == EventType::TimerCanceled {
            let canceled_timer = event.schedule_event_id;
            state.pending_events.retain(|pending| {
                !(pending.event_type() == EventType::TimerFired
                    && pending.schedule_event_id == canceled_timer)
            });
        }
        state.history.push(event);
        Ok(())
    }

    fn route_message(inner: &mut Inner, message: WorkflowEvent) {
        let instance_id = message.instance.instance_id.clone();
        match message.event.event_type() {
            EventType::ExecutionStarted => {
                let state = inner
                    .instances
                    .entry(instance_id)
                    .or_insert_with(|| InstanceState::new(message.instance.clone()));
                if state.started {
                    tracing::debug!(
                        instance_id = %state.instance.instance_id,
                        "dropping duplicate start message"
                    );
                    return;
                }
                // A signal may have raced ahead of the start message and left
                // a dormant entry without the parent reference.
                state.instance = message.instance;
                state.started = true;
                state.pending_events.push(message.event);
            }
            _ => {
                let state = inner
                    .instances
                    .entry(instance_id)
                    .or_insert_with(|| InstanceState::new(message.instance.clone()));
                if state.completed {
                    tracing::debug!(
                        instance_id = %state.instance.instance_id,
                        event_type = %message.event.event_type(),
                        "dropping message for finished instance"
                    );
                    return;
                }
                state.pending_events.push(message.event);
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        event: Event,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.instances.get(&instance.instance_id) {
            if existing.instance.execution_id == instance.execution_id {
                return Ok(());
            }
            return Err(BackendError::InstanceAlreadyExists(instance.instance_id));
        }

        let mut state = InstanceState::new(instance.clone());
        state.started = true;
        state.pending_events.push(event);
        inner.instances.insert(instance.instance_id, state);
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError> {
        let mut inner = self.lock()?;
        let state = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;
        if state.completed {
            return Err(BackendError::InstanceFinished(instance_id.to_string()));
        }
        state.pending_events.push(event);
        Ok(())
    }

    async fn cancel_workflow_instance(&self, instance_id: &str) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let state = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;
        if state.completed {
            return Err(BackendError::InstanceFinished(instance_id.to_string()));
        }
        state
            .pending_events
            .push(Event::new(now, 0, heddle_core::history::EventAttributes::ExecutionCanceled));
        Ok(())
    }

    async fn terminate_workflow_instance(&self, instance_id: &str) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let state = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;
        if state.completed {
            return Err(BackendError::InstanceFinished(instance_id.to_string()));
        }
        state.pending_events.clear();
        state.lease = None;
        Self::append_history(
            state,
            Event::new(now, 0, heddle_core::history::EventAttributes::ExecutionTerminated),
        )
    }

    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;

        for state in inner.instances.values_mut() {
            if state.completed || !state.started {
                continue;
            }
            if let Some(lease) = state.lease.take() {
                if lease.expires_at > now {
                    state.lease = Some(lease);
                    continue;
                }
                // Expired lease: the worker died mid-task. Requeue what it
                // was given, ahead of anything that arrived since.
                let mut requeued = lease.dispatched;
                requeued.append(&mut state.pending_events);
                state.pending_events = requeued;
            }

            let (visible, invisible): (Vec<Event>, Vec<Event>) = state
                .pending_events
                .drain(..)
                .partition(|e| e.visible_at.map_or(true, |v| v <= now));
            state.pending_events = invisible;
            if visible.is_empty() {
                continue;
            }

            state.lease = Some(WorkflowLease {
                expires_at: now + self.lease_duration,
                dispatched: visible.clone(),
            });

            return Ok(Some(WorkflowTask {
                instance: state.instance.clone(),
                metadata: WorkflowMetadata::default(),
                last_sequence_id: state.history.last().map_or(0, |e| e.sequence_id),
                history: state.history.clone(),
                new_events: visible,
            }));
        }

        Ok(None)
    }

    async fn extend_workflow_task(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let state = inner
            .instances
            .get_mut(&instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        match &mut state.lease {
            Some(lease) => {
                lease.expires_at = now + self.lease_duration;
                Ok(())
            }
            None => Err(BackendError::LeaseLost(instance.instance_id.clone())),
        }
    }

    async fn complete_workflow_task(
        &self,
        task: WorkflowTask,
        executed: Vec<Event>,
        activity_events: Vec<Event>,
        timer_events: Vec<Event>,
        workflow_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;

        {
            let state = inner
                .instances
                .get_mut(&task.instance.instance_id)
                .ok_or_else(|| BackendError::InstanceNotFound(task.instance.instance_id.clone()))?;

            // An expired lease stays in place: the next poll requeues the
            // events it was holding.
            let lease_held = state.lease.as_ref().is_some_and(|l| l.expires_at > now);
            if !lease_held {
                return Err(BackendError::LeaseLost(task.instance.instance_id.clone()));
            }
            // Check before mutating anything so the commit stays all-or-nothing.
            if state.completed {
                return Err(BackendError::InstanceFinished(task.instance.instance_id.clone()));
            }
            state.lease = None;

            for event in executed {
                Self::append_history(state, event)?;
            }
            state.pending_events.extend(timer_events);
        }

        for event in activity_events {
            let activity_task = ActivityTask {
                id: Uuid::new_v4().to_string(),
                instance: task.instance.clone(),
                event,
            };
            inner.activity_queue.push_back(activity_task);
        }

        for message in workflow_events {
            Self::route_message(&mut inner, message);
        }

        Ok(())
    }

    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;

        let expired: Vec<String> = inner
            .activity_leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(lease) = inner.activity_leases.remove(&id) {
                inner.activity_queue.push_front(lease.task);
            }
        }

        match inner.activity_queue.pop_front() {
            Some(task) => {
                inner.activity_leases.insert(
                    task.id.clone(),
                    ActivityLease { task: task.clone(), expires_at: now + self.lease_duration },
                );
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.activity_leases.get_mut(task_id) {
            Some(lease) => {
                lease.expires_at = now + self.lease_duration;
                Ok(())
            }
            None => Err(BackendError::ActivityTaskNotFound(task_id.to_string())),
        }
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock()?;
        if inner.activity_leases.remove(task_id).is_none() {
            return Err(BackendError::LeaseLost(task_id.to_string()));
        }

        let state = inner
            .instances
            .get_mut(&instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        if state.completed {
            tracing::debug!(
                instance_id = %instance.instance_id,
                "dropping activity result for finished instance"
            );
            return Ok(());
        }
        state.pending_events.push(event);
        Ok(())
    }
}
