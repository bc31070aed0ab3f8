use serde::{Deserialize, Serialize};

/// Identifies one logical workflow execution.
///
/// Sub-workflow instances carry a weak reference to their parent: plain
/// identifier values, never an owning handle. Lookups always go through the
/// backend, so no in-memory parent/child cycle can form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentExecution>,
}

/// Reference from a sub-workflow back to the execution that scheduled it.
///
/// `schedule_event_id` is the parent's originating `ScheduleSubWorkflow`
/// command ID; completion messages sent back to the parent carry it so the
/// parent can resolve the right future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentExecution {
    pub instance_id: String,
    pub execution_id: String,
    pub schedule_event_id: u64,
}

impl WorkflowInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: None,
        }
    }

    pub fn new_sub_workflow(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        parent: ParentExecution,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: Some(parent),
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        self.parent.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_workflow_carries_parent_reference() {
        let parent = ParentExecution {
            instance_id: "parent".to_string(),
            execution_id: "e1".to_string(),
            schedule_event_id: 4,
        };
        let child = WorkflowInstance::new_sub_workflow("child", "e2", parent);

        assert!(child.is_sub_workflow());
        assert_eq!(child.parent.as_ref().unwrap().schedule_event_id, 4);
        assert!(!WorkflowInstance::new("root", "e1").is_sub_workflow());
    }
}
