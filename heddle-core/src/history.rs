//! Durable history events.
//!
//! History is the sole authoritative record of a workflow execution: an
//! append-only, totally ordered sequence of events per instance. Replay feeds
//! these events back into workflow code; everything the workflow observed the
//! first time around is reconstructed from them.

use crate::instance::WorkflowInstance;
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Discriminant of an [`Event`], derived from its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionTerminated,
    ExecutionCanceled,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    TimerCanceled,
    SubWorkflowScheduled,
    SubWorkflowCompleted,
    SubWorkflowFailed,
    SubWorkflowCancellationRequested,
    SignalReceived,
    SideEffectResult,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed attributes, tagged by event type on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "attributes")]
pub enum EventAttributes {
    ExecutionStarted {
        name: String,
        version: String,
        inputs: Vec<Payload>,
    },
    ExecutionCompleted {
        result: Option<Payload>,
        error: Option<String>,
    },
    ExecutionTerminated,
    ExecutionCanceled,
    ActivityScheduled {
        name: String,
        version: String,
        inputs: Vec<Payload>,
    },
    ActivityCompleted {
        result: Option<Payload>,
    },
    ActivityFailed {
        reason: String,
    },
    TimerScheduled {
        at: DateTime<Utc>,
    },
    TimerFired {
        at: DateTime<Utc>,
    },
    TimerCanceled,
    SubWorkflowScheduled {
        instance_id: String,
        name: String,
        version: String,
        inputs: Vec<Payload>,
    },
    SubWorkflowCompleted {
        result: Option<Payload>,
    },
    SubWorkflowFailed {
        reason: String,
    },
    SubWorkflowCancellationRequested,
    SignalReceived {
        name: String,
        arg: Option<Payload>,
    },
    SideEffectResult {
        result: Payload,
    },
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::ExecutionStarted { .. } => EventType::ExecutionStarted,
            EventAttributes::ExecutionCompleted { .. } => EventType::ExecutionCompleted,
            EventAttributes::ExecutionTerminated => EventType::ExecutionTerminated,
            EventAttributes::ExecutionCanceled => EventType::ExecutionCanceled,
            EventAttributes::ActivityScheduled { .. } => EventType::ActivityScheduled,
            EventAttributes::ActivityCompleted { .. } => EventType::ActivityCompleted,
            EventAttributes::ActivityFailed { .. } => EventType::ActivityFailed,
            EventAttributes::TimerScheduled { .. } => EventType::TimerScheduled,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
            EventAttributes::TimerCanceled => EventType::TimerCanceled,
            EventAttributes::SubWorkflowScheduled { .. } => EventType::SubWorkflowScheduled,
            EventAttributes::SubWorkflowCompleted { .. } => EventType::SubWorkflowCompleted,
            EventAttributes::SubWorkflowFailed { .. } => EventType::SubWorkflowFailed,
            EventAttributes::SubWorkflowCancellationRequested => {
                EventType::SubWorkflowCancellationRequested
            }
            EventAttributes::SignalReceived { .. } => EventType::SignalReceived,
            EventAttributes::SideEffectResult { .. } => EventType::SideEffectResult,
        }
    }
}

/// The atomic unit of durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique token.
    pub id: String,
    /// Monotonic position within the instance, assigned when persisted;
    /// zero until then.
    pub sequence_id: i64,
    pub timestamp: DateTime<Utc>,
    /// ID of the command (and thus schedule event) this event originated
    /// from. Result events carry the same value as their schedule event.
    pub schedule_event_id: u64,
    #[serde(flatten)]
    pub attributes: EventAttributes,
    /// Delivery barrier: the backend must not hand this event to a worker
    /// before `visible_at`. Used for timer-fired events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(
        timestamp: DateTime<Utc>,
        schedule_event_id: u64,
        attributes: EventAttributes,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sequence_id: 0,
            timestamp,
            schedule_event_id,
            attributes,
            visible_at: None,
        }
    }

    pub fn with_visible_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible_at = Some(at);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    /// Whether this event ends the instance: nothing may be appended after it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::ExecutionCompleted | EventType::ExecutionTerminated
        )
    }
}

/// A history event addressed to a (possibly different) workflow instance.
///
/// Messages are how instances affect each other: starting a sub-workflow,
/// reporting its completion back to the parent, requesting cancellation,
/// signaling. Routing happens inside the backend's atomic commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance: WorkflowInstance,
    pub event: Event,
}
