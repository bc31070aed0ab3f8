//! Units of work handed to workers under a lease.

use crate::history::Event;
use crate::instance::WorkflowInstance;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form metadata propagated alongside a workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMetadata(pub HashMap<String, String>);

/// A batch of deliverable events for one instance, together with the prior
/// history needed to replay up to them. At most one workflow task per
/// instance is ever leased out at a time.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub instance: WorkflowInstance,
    pub metadata: WorkflowMetadata,
    /// Sequence ID of the last committed event, acknowledged on completion.
    pub last_sequence_id: i64,
    /// Committed history, in sequence order.
    pub history: Vec<Event>,
    /// Newly deliverable events, not yet part of history.
    pub new_events: Vec<Event>,
}

/// One activity invocation. `event` is the originating `ActivityScheduled`
/// event; its `schedule_event_id` correlates the result back to the waiting
/// workflow future.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub id: String,
    pub instance: WorkflowInstance,
    pub event: Event,
}
