use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::task::Task;

/// Lifecycle event kinds published on the orchestrator bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum EventKind {
    TaskSubmitted,
    TaskApproved,
    TaskRequiresApproval,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    /// Notice republished from a registered agent, named `agent_<event>`
    Agent(String),
}

impl EventKind {
    /// Whether the event reports a task reaching a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted | Self::TaskFailed | Self::TaskCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskSubmitted => f.write_str("task_submitted"),
            Self::TaskApproved => f.write_str("task_approved"),
            Self::TaskRequiresApproval => f.write_str("task_requires_approval"),
            Self::TaskStarted => f.write_str("task_started"),
            Self::TaskCompleted => f.write_str("task_completed"),
            Self::TaskFailed => f.write_str("task_failed"),
            Self::TaskCancelled => f.write_str("task_cancelled"),
            Self::Agent(event) => write!(f, "agent_{}", event),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.to_string()
    }
}

/// Event published to orchestrator observers, carrying a snapshot of the task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorEvent {
    pub kind: EventKind,
    pub task: Task,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind, task: Task, data: Value) -> Self {
        Self {
            kind,
            task,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::TaskRequiresApproval.to_string(), "task_requires_approval");
        assert_eq!(EventKind::Agent("spawned".into()).to_string(), "agent_spawned");
        assert!(EventKind::TaskCancelled.is_terminal());
        assert!(!EventKind::TaskStarted.is_terminal());
    }

    #[test]
    fn test_event_serializes_kind_as_name() {
        let event = OrchestratorEvent::new(EventKind::TaskSubmitted, Task::new("t", ""), json!({}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], json!("task_submitted"));
        assert_eq!(value["task"]["name"], json!("t"));
    }
}
