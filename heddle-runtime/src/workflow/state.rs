//! Per-execution workflow state: the command counter, in-flight futures,
//! signal channels and the commands emitted this slice. Confined to one
//! task execution; the instance lease guarantees no other worker can
//! observe it.

use crate::sync::channel::Channel;
use crate::sync::future::SharedFuture;
use crate::sync::scheduler::SchedulerShared;
use chrono::{DateTime, Utc};
use heddle_core::command::{Command, CommandState};
use heddle_core::history::{Event, WorkflowEvent};
use heddle_core::instance::WorkflowInstance;
use heddle_core::payload::Payload;
use heddle_core::error::WorkflowError;
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) struct WorkflowState {
    instance: WorkflowInstance,
    commands: Vec<Command>,
    next_command_id: u64,
    futures: HashMap<u64, SharedFuture<Payload>>,
    signal_channels: HashMap<String, Channel<Payload>>,
    /// Fire-and-forget messages (signals, cancellation requests) emitted by
    /// workflow code this slice. Suppressed during replay: they were already
    /// delivered at least once when the slice first ran.
    out_messages: Vec<WorkflowEvent>,
    now: DateTime<Utc>,
    replaying: bool,
    started: bool,
}

impl WorkflowState {
    pub(crate) fn new(instance: WorkflowInstance, now: DateTime<Utc>) -> Self {
        Self {
            instance,
            commands: Vec::new(),
            next_command_id: 1,
            futures: HashMap::new(),
            signal_channels: HashMap::new(),
            out_messages: Vec::new(),
            now,
            replaying: false,
            started: false,
        }
    }

    pub(crate) fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn set_now(&mut self, now: DateTime<Utc>) {
        self.now = now;
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub(crate) fn mark_started(&mut self) -> bool {
        let first = !self.started;
        self.started = true;
        first
    }

    pub(crate) fn allocate_command_id(&mut self) -> u64 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    pub(crate) fn push_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Marks a still-pending command canceled. Commands from earlier slices
    /// (already committed) are untouched.
    pub(crate) fn cancel_command(&mut self, id: u64) {
        if let Some(command) = self.commands.iter_mut().find(|c| c.id == id) {
            if command.state == CommandState::Pending {
                command.state = CommandState::Canceled;
            }
        }
    }

    /// Creates and registers the future a result event will later resolve.
    pub(crate) fn register_future(
        &mut self,
        command_id: u64,
        shared: Rc<SchedulerShared>,
    ) -> SharedFuture<Payload> {
        let future = SharedFuture::new(shared);
        self.futures.insert(command_id, future.clone());
        future
    }

    /// Resolves the in-flight future correlated by `schedule_event_id`.
    /// Returns false when no such future was ever registered.
    pub(crate) fn resolve_future(
        &mut self,
        schedule_event_id: u64,
        result: Result<Payload, WorkflowError>,
    ) -> bool {
        match self.futures.get(&schedule_event_id) {
            Some(future) => {
                future.settle(result);
                true
            }
            None => false,
        }
    }

    /// Returns the channel for a signal name, creating it on first use.
    /// Values sent before any receiver exists are buffered.
    pub(crate) fn signal_channel(
        &mut self,
        name: &str,
        shared: &Rc<SchedulerShared>,
    ) -> Channel<Payload> {
        self.signal_channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(Rc::clone(shared)))
            .clone()
    }

    pub(crate) fn push_message(&mut self, message: WorkflowEvent) {
        self.out_messages.push(message);
    }

    pub(crate) fn take_messages(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.out_messages)
    }

    /// Reconciles a schedule-class event from history against the command
    /// the re-run code emitted for it, by `(event type, correlation ID)`.
    /// No match means the workflow code diverged from the recorded
    /// execution.
    pub(crate) fn match_schedule_event(&mut self, event: &Event) -> Result<(), String> {
        let expected = (event.event_type(), event.schedule_event_id);
        let command = self.commands.iter_mut().find(|c| {
            matches!(c.state, CommandState::Pending | CommandState::Canceled)
                && c.expected_schedule_event() == expected
        });
        match command {
            Some(command) => {
                command.state = CommandState::Committed;
                Ok(())
            }
            None => Err(format!(
                "history event {}#{} has no matching command",
                event.event_type(),
                event.schedule_event_id,
            )),
        }
    }

    /// After replay, every command the re-run code emitted must have been
    /// reconciled; a leftover means the code now does something history
    /// never recorded.
    pub(crate) fn unmatched_replay_command(&self) -> Option<&Command> {
        self.commands
            .iter()
            .find(|c| matches!(c.state, CommandState::Pending | CommandState::Canceled))
    }

    pub(crate) fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }
}
