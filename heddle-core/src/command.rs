//! Commands: intent emitted by workflow code during an execution slice.
//!
//! Each command translates into exactly one schedule event (plus, for some
//! commands, pending events or messages to other instances). The translation
//! lives here so the executor, the worker, and the test harness all share a
//! single path.

use crate::history::{Event, EventAttributes, EventType, WorkflowEvent};
use crate::instance::{ParentExecution, WorkflowInstance};
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Emitted this slice, not yet reconciled or translated.
    Pending,
    /// Matched against a schedule event during replay; never re-translated.
    Committed,
    /// Canceled while still pending in the same slice.
    Canceled,
    /// Translated into events.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    ScheduleActivity,
    ScheduleTimer,
    CancelTimer,
    ScheduleSubWorkflow,
    SideEffect,
    CompleteWorkflow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandAttributes {
    ScheduleActivity {
        name: String,
        version: String,
        inputs: Vec<Payload>,
    },
    ScheduleTimer {
        at: DateTime<Utc>,
    },
    CancelTimer {
        /// Command ID of the timer being canceled.
        timer_event_id: u64,
    },
    ScheduleSubWorkflow {
        instance_id: String,
        name: String,
        version: String,
        inputs: Vec<Payload>,
    },
    SideEffect {
        result: Payload,
    },
    CompleteWorkflow {
        result: Option<Payload>,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: u64,
    pub state: CommandState,
    pub attributes: CommandAttributes,
}

/// Events and messages produced by translating one command.
#[derive(Debug, Default)]
pub struct CommandResult {
    /// Events to append to the instance's own history.
    pub events: Vec<Event>,
    /// `ActivityScheduled` events the backend must additionally enqueue as
    /// activity tasks.
    pub activity_events: Vec<Event>,
    /// Pending events that become deliverable later (`TimerFired` with its
    /// `visible_at` barrier). Not part of history until delivered.
    pub timer_events: Vec<Event>,
    /// Messages routed to other instances.
    pub workflow_events: Vec<WorkflowEvent>,
    /// Whether the instance reached a terminal state.
    pub completed: bool,
}

impl Command {
    pub fn new(id: u64, attributes: CommandAttributes) -> Self {
        Self { id, state: CommandState::Pending, attributes }
    }

    pub fn command_type(&self) -> CommandType {
        match self.attributes {
            CommandAttributes::ScheduleActivity { .. } => CommandType::ScheduleActivity,
            CommandAttributes::ScheduleTimer { .. } => CommandType::ScheduleTimer,
            CommandAttributes::CancelTimer { .. } => CommandType::CancelTimer,
            CommandAttributes::ScheduleSubWorkflow { .. } => CommandType::ScheduleSubWorkflow,
            CommandAttributes::SideEffect { .. } => CommandType::SideEffect,
            CommandAttributes::CompleteWorkflow { .. } => CommandType::CompleteWorkflow,
        }
    }

    /// The `(event type, correlation ID)` pair this command reconciles
    /// against during replay.
    pub fn expected_schedule_event(&self) -> (EventType, u64) {
        match &self.attributes {
            CommandAttributes::ScheduleActivity { .. } => (EventType::ActivityScheduled, self.id),
            CommandAttributes::ScheduleTimer { .. } => (EventType::TimerScheduled, self.id),
            CommandAttributes::CancelTimer { timer_event_id } => {
                (EventType::TimerCanceled, *timer_event_id)
            }
            CommandAttributes::ScheduleSubWorkflow { .. } => {
                (EventType::SubWorkflowScheduled, self.id)
            }
            CommandAttributes::SideEffect { .. } => (EventType::SideEffectResult, self.id),
            CommandAttributes::CompleteWorkflow { .. } => (EventType::ExecutionCompleted, self.id),
        }
    }

    /// Translates the command into durable events and messages, consuming its
    /// pending state. Commands already committed during replay produce
    /// nothing.
    pub fn execute(&mut self, now: DateTime<Utc>, instance: &WorkflowInstance) -> CommandResult {
        let mut result = CommandResult::default();
        let canceled = self.state == CommandState::Canceled;
        if !matches!(self.state, CommandState::Pending | CommandState::Canceled) {
            return result;
        }
        self.state = CommandState::Done;

        match &self.attributes {
            CommandAttributes::ScheduleActivity { name, version, inputs } => {
                let event = Event::new(
                    now,
                    self.id,
                    EventAttributes::ActivityScheduled {
                        name: name.clone(),
                        version: version.clone(),
                        inputs: inputs.clone(),
                    },
                );
                result.activity_events.push(event.clone());
                result.events.push(event);
            }
            CommandAttributes::ScheduleTimer { at } => {
                result.events.push(Event::new(
                    now,
                    self.id,
                    EventAttributes::TimerScheduled { at: *at },
                ));
                // A timer canceled in the slice that created it never fires.
                if !canceled {
                    result.timer_events.push(
                        Event::new(now, self.id, EventAttributes::TimerFired { at: *at })
                            .with_visible_at(*at),
                    );
                }
            }
            CommandAttributes::CancelTimer { timer_event_id } => {
                result.events.push(Event::new(
                    now,
                    *timer_event_id,
                    EventAttributes::TimerCanceled,
                ));
            }
            CommandAttributes::ScheduleSubWorkflow { instance_id, name, version, inputs } => {
                result.events.push(Event::new(
                    now,
                    self.id,
                    EventAttributes::SubWorkflowScheduled {
                        instance_id: instance_id.clone(),
                        name: name.clone(),
                        version: version.clone(),
                        inputs: inputs.clone(),
                    },
                ));

                let child = WorkflowInstance::new_sub_workflow(
                    instance_id.clone(),
                    Uuid::new_v4().to_string(),
                    ParentExecution {
                        instance_id: instance.instance_id.clone(),
                        execution_id: instance.execution_id.clone(),
                        schedule_event_id: self.id,
                    },
                );
                result.workflow_events.push(WorkflowEvent {
                    instance: child,
                    event: Event::new(
                        now,
                        self.id,
                        EventAttributes::ExecutionStarted {
                            name: name.clone(),
                            version: version.clone(),
                            inputs: inputs.clone(),
                        },
                    ),
                });
            }
            CommandAttributes::SideEffect { result: value } => {
                result.events.push(Event::new(
                    now,
                    self.id,
                    EventAttributes::SideEffectResult { result: value.clone() },
                ));
            }
            CommandAttributes::CompleteWorkflow { result: value, error } => {
                result.events.push(Event::new(
                    now,
                    self.id,
                    EventAttributes::ExecutionCompleted {
                        result: value.clone(),
                        error: error.clone(),
                    },
                ));
                result.completed = true;

                if let Some(parent) = &instance.parent {
                    let attributes = match error {
                        Some(reason) => EventAttributes::SubWorkflowFailed { reason: reason.clone() },
                        None => EventAttributes::SubWorkflowCompleted { result: value.clone() },
                    };
                    result.workflow_events.push(WorkflowEvent {
                        instance: WorkflowInstance::new(
                            parent.instance_id.clone(),
                            parent.execution_id.clone(),
                        ),
                        event: Event::new(now, parent.schedule_event_id, attributes),
                    });
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new("instance-1", "execution-1")
    }

    #[test]
    fn schedule_activity_produces_task_and_history_event() {
        let mut command = Command::new(
            1,
            CommandAttributes::ScheduleActivity {
                name: "a".to_string(),
                version: String::new(),
                inputs: vec![],
            },
        );
        let result = command.execute(Utc::now(), &instance());

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.activity_events.len(), 1);
        assert_eq!(result.events[0].event_type(), EventType::ActivityScheduled);
        assert_eq!(result.events[0].schedule_event_id, 1);
        assert_eq!(command.state, CommandState::Done);
    }

    #[test]
    fn schedule_timer_emits_invisible_fired_event() {
        let at = Utc::now() + chrono::Duration::seconds(30);
        let mut command = Command::new(2, CommandAttributes::ScheduleTimer { at });
        let result = command.execute(Utc::now(), &instance());

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.timer_events.len(), 1);
        assert_eq!(result.timer_events[0].event_type(), EventType::TimerFired);
        assert_eq!(result.timer_events[0].visible_at, Some(at));
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let at = Utc::now() + chrono::Duration::seconds(30);
        let mut command = Command::new(2, CommandAttributes::ScheduleTimer { at });
        command.state = CommandState::Canceled;
        let result = command.execute(Utc::now(), &instance());

        assert_eq!(result.events.len(), 1);
        assert!(result.timer_events.is_empty());
    }

    #[test]
    fn cancel_timer_references_the_timer_command() {
        let mut command = Command::new(3, CommandAttributes::CancelTimer { timer_event_id: 2 });
        let result = command.execute(Utc::now(), &instance());

        assert_eq!(result.events[0].event_type(), EventType::TimerCanceled);
        assert_eq!(result.events[0].schedule_event_id, 2);
    }

    #[test]
    fn sub_workflow_message_carries_parent_reference() {
        let mut command = Command::new(
            4,
            CommandAttributes::ScheduleSubWorkflow {
                instance_id: "child-1".to_string(),
                name: "child".to_string(),
                version: String::new(),
                inputs: vec![],
            },
        );
        let result = command.execute(Utc::now(), &instance());

        assert_eq!(result.workflow_events.len(), 1);
        let message = &result.workflow_events[0];
        assert_eq!(message.instance.instance_id, "child-1");
        let parent = message.instance.parent.as_ref().unwrap();
        assert_eq!(parent.instance_id, "instance-1");
        assert_eq!(parent.schedule_event_id, 4);
    }

    #[test]
    fn completing_a_sub_workflow_notifies_the_parent() {
        let child = WorkflowInstance::new_sub_workflow(
            "child-1",
            "e2",
            ParentExecution {
                instance_id: "instance-1".to_string(),
                execution_id: "execution-1".to_string(),
                schedule_event_id: 7,
            },
        );
        let mut command = Command::new(
            1,
            CommandAttributes::CompleteWorkflow { result: Some(Payload::from(b"3".to_vec())), error: None },
        );
        let result = command.execute(Utc::now(), &child);

        assert!(result.completed);
        assert_eq!(result.workflow_events.len(), 1);
        let message = &result.workflow_events[0];
        assert_eq!(message.instance.instance_id, "instance-1");
        assert_eq!(message.event.schedule_event_id, 7);
        assert_eq!(message.event.event_type(), EventType::SubWorkflowCompleted);
    }

    #[test]
    fn committed_commands_are_not_retranslated() {
        let mut command = Command::new(
            1,
            CommandAttributes::ScheduleActivity {
                name: "a".to_string(),
                version: String::new(),
                inputs: vec![],
            },
        );
        command.state = CommandState::Committed;
        let result = command.execute(Utc::now(), &instance());

        assert!(result.events.is_empty());
        assert!(result.activity_events.is_empty());
    }
}
