use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Free-form JSON object carried as task input/output
pub type DataMap = serde_json::Map<String, Value>;

/// Highest progress a task may report before it actually completes.
/// `1.0` is reserved for a successful `Completed` transition.
pub const MAX_IN_FLIGHT_PROGRESS: f64 = 0.99;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    ApprovalRequired,
}

impl TaskStatus {
    /// Human readable status name
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::ApprovalRequired => "Approval Required",
        }
    }

    /// Completed, failed and cancelled tasks never change status again
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed | Self::Failed | Self::Cancelled => true,
            Self::Pending | Self::Running | Self::ApprovalRequired => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Task priority, ordered from lowest to highest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A unit of work handled by one agent.
///
/// A task owns its `subtasks`; a subtask only points back at its parent
/// through `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Agent bound to this task. Empty means "route automatically".
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<Task>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: Option<DataMap>,
    #[serde(default)]
    pub error: Option<String>,
    /// 0.0 ..= 1.0
    #[serde(default)]
    pub progress: f64,
}

impl Task {
    /// Create a pending task
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", Uuid::new_v4().simple()),
            name: name.into(),
            description: description.into(),
            agent_id: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_id: None,
            subtasks: Vec::new(),
            requires_approval: false,
            approved_by: None,
            input_data: DataMap::new(),
            output_data: None,
            error: None,
            progress: 0.0,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_data.insert(key.into(), value.into());
        self
    }

    /// Change status, stamping start/completion times
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        match status {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed => {
                self.completed_at = Some(Utc::now());
                self.progress = 1.0;
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending | TaskStatus::ApprovalRequired => {}
        }
    }

    /// Clear the state of any previous run so the task can be queued again.
    /// Approval is kept.
    pub fn reset_for_submit(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.output_data = None;
    }

    /// Record intermediate progress. Values are clamped so that a task
    /// never reports `1.0` before it has completed.
    pub fn report_progress(&mut self, progress: f64) -> f64 {
        let clamped = if progress.is_nan() {
            self.progress
        } else {
            progress.clamp(0.0, MAX_IN_FLIGHT_PROGRESS)
        };
        if self.status != TaskStatus::Completed {
            self.progress = clamped;
        }
        self.progress
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Gated tasks wait in `ApprovalRequired` until someone approves them
    pub fn awaiting_approval(&self) -> bool {
        self.requires_approval && self.approved_by.is_none()
    }

    /// Task type hint used by agents to decide whether they can handle it
    pub fn task_type(&self) -> Option<&str> {
        self.input_data.get("task_type").and_then(Value::as_str)
    }

    /// Find a subtask anywhere below this task
    pub fn find_subtask(&self, id: &str) -> Option<&Task> {
        self.subtasks.iter().find_map(|sub| {
            if sub.id == id {
                Some(sub)
            } else {
                sub.find_subtask(id)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Scan images", "Run the vulnerability scanner");
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.name, "Scan images");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.progress, 0.0);
        assert!(task.agent_id.is_empty());
    }

    #[test]
    fn test_status_transition() {
        let mut task = Task::new("Test", "");
        assert!(task.started_at.is_none());

        task.set_status(TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        task.set_status(TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_failed_transition_keeps_progress() {
        let mut task = Task::new("Test", "");
        task.set_status(TaskStatus::Running);
        task.report_progress(0.4);
        task.set_status(TaskStatus::Failed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.progress, 0.4);
    }

    #[test]
    fn test_progress_is_clamped_below_completion() {
        let mut task = Task::new("Test", "");
        assert_eq!(task.report_progress(-3.0), 0.0);
        assert_eq!(task.report_progress(2.0), MAX_IN_FLIGHT_PROGRESS);
        assert_eq!(task.report_progress(f64::NAN), MAX_IN_FLIGHT_PROGRESS);
        assert!(task.progress < 1.0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::ApprovalRequired.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::ApprovalRequired).unwrap();
        assert_eq!(json, "\"approval_required\"");
        let status: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_task_round_trip_with_subtasks() {
        let mut parent = Task::new("Fix container", "Restart and patch")
            .with_priority(TaskPriority::High)
            .with_approval()
            .with_input("container", "web-1");
        parent.set_status(TaskStatus::Running);
        parent.report_progress(0.25);

        let mut child = Task::new("Restart", "").with_agent("docker");
        child.parent_id = Some(parent.id.clone());
        child.set_status(TaskStatus::Completed);
        child.output_data = Some(json!({"restarted": true}).as_object().unwrap().clone());

        let mut grandchild = Task::new("Verify", "");
        grandchild.parent_id = Some(child.id.clone());
        grandchild.error = Some("health check flapping".into());
        child.subtasks.push(grandchild);
        parent.subtasks.push(child);

        let json = serde_json::to_string(&parent).unwrap();
        let restored: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, parent);
        assert_eq!(restored.started_at, parent.started_at);
        assert_eq!(restored.subtasks[0].completed_at, parent.subtasks[0].completed_at);
    }

    #[test]
    fn test_progress_round_trips_exactly() {
        for value in [1.0 / 3.0, 0.9536741549842809, 0.1 + 0.2, 0.7071067811865476] {
            let mut task = Task::new("t", "");
            task.set_status(TaskStatus::Running);
            task.report_progress(value);

            let json = serde_json::to_string(&task).unwrap();
            let restored: Task = serde_json::from_str(&json).unwrap();
            assert_eq!(restored.progress.to_bits(), task.progress.to_bits());
            assert_eq!(restored, task);
        }
    }

    #[test]
    fn test_reset_for_submit_clears_previous_run() {
        let mut task = Task::new("t", "").with_approval();
        task.approved_by = Some("alice".into());
        task.set_status(TaskStatus::Running);
        task.error = Some("boom".into());
        task.output_data = Some(DataMap::new());
        task.set_status(TaskStatus::Completed);

        task.reset_for_submit();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.error.is_none());
        assert!(task.output_data.is_none());
        assert_eq!(task.approved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_find_subtask_searches_nested_levels() {
        let mut parent = Task::new("root", "");
        let mut child = Task::new("child", "");
        let grandchild = Task::new("grandchild", "");
        let grandchild_id = grandchild.id.clone();
        child.subtasks.push(grandchild);
        parent.subtasks.push(child);

        assert_eq!(parent.find_subtask(&grandchild_id).unwrap().name, "grandchild");
        assert!(parent.find_subtask("missing").is_none());
    }

    #[test]
    fn test_task_type_and_approval_flags() {
        let task = Task::new("t", "").with_input("task_type", "scan").with_approval();
        assert_eq!(task.task_type(), Some("scan"));
        assert!(task.awaiting_approval());
    }
}
