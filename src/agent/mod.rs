//! Capability interface implemented by task handlers.
//!
//! An [`Agent`] executes tasks of the kinds it can handle. The orchestrator
//! only ever talks to agents through this trait.

mod command;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::task::{Task, TaskContext, TaskResult};

pub use command::{CommandAgent, CommandSpec};

/// Advisory estimate returned when an agent has no better guess
pub const DEFAULT_ESTIMATE: Duration = Duration::from_secs(60);

const NOTICE_CAPACITY: usize = 64;

/// Descriptive metadata about an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub supported_task_types: Vec<String>,
}

impl AgentInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            supported_task_types: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_task_types = types.into_iter().map(Into::into).collect();
        self
    }
}

/// What an execution needs from its environment, checked against the
/// security policy before the agent runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub filesystem: bool,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub syscalls: Vec<String>,
    #[serde(default)]
    pub subprocesses: u32,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// Lifecycle notice published by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNotice {
    pub agent_id: String,
    pub task: Task,
    pub event: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Per-agent publish/subscribe channel.
///
/// Every subscriber owns its receiver, so a slow or failing observer never
/// affects the agent or other observers.
#[derive(Debug, Clone)]
pub struct AgentObservers {
    tx: broadcast::Sender<AgentNotice>,
}

impl Default for AgentObservers {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentObservers {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentNotice> {
        self.tx.subscribe()
    }

    /// Publish a notice. Having no observers is not an error.
    pub fn notify(&self, agent_id: &str, task: &Task, event: impl Into<String>, data: Value) {
        let _ = self.tx.send(AgentNotice {
            agent_id: agent_id.to_string(),
            task: task.clone(),
            event: event.into(),
            data,
            timestamp: Utc::now(),
        });
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A pluggable task handler.
///
/// `execute` is the single suspension point seen by the orchestrator: it
/// may await internally and is dropped when the task is cancelled or
/// times out. An `Err` is treated as an execution fault.
#[async_trait]
pub trait Agent: Send + Sync {
    fn info(&self) -> &AgentInfo;

    fn id(&self) -> &str {
        &self.info().id
    }

    async fn execute(&self, task: &Task, context: &TaskContext) -> anyhow::Result<TaskResult>;

    /// Used to route tasks submitted without an explicit agent
    fn can_handle(&self, _task: &Task) -> bool {
        true
    }

    /// Advisory only, never enforced
    fn estimate_duration(&self, _task: &Task) -> Duration {
        DEFAULT_ESTIMATE
    }

    fn requirements(&self, _task: &Task) -> Requirements {
        Requirements::default()
    }

    fn observers(&self) -> &AgentObservers;

    fn notify_observers(&self, task: &Task, event: &str, data: Value) {
        self.observers().notify(self.id(), task, event, data);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedAgent;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_info_builder() {
        let info = AgentInfo::new("scanner", "Security Scanner")
            .with_description("Scans images")
            .with_task_types(["scan", "audit"]);
        assert_eq!(info.id, "scanner");
        assert_eq!(info.supported_task_types, vec!["scan", "audit"]);
    }

    #[test]
    fn test_default_trait_methods() {
        let agent = ScriptedAgent::succeeding("echo");
        let task = Task::new("t", "");
        assert_eq!(agent.id(), "echo");
        assert!(agent.can_handle(&task));
        assert_eq!(agent.estimate_duration(&task), DEFAULT_ESTIMATE);
        assert_eq!(agent.requirements(&task), Requirements::default());
    }

    #[tokio::test]
    async fn test_observers_receive_notices() {
        let agent = ScriptedAgent::succeeding("echo");
        let mut first = agent.observers().subscribe();
        let mut second = agent.observers().subscribe();
        assert_eq!(agent.observers().observer_count(), 2);

        let task = Task::new("t", "");
        agent.notify_observers(&task, "progress", json!({"step": 1}));

        let notice = first.recv().await.unwrap();
        assert_eq!(notice.agent_id, "echo");
        assert_eq!(notice.event, "progress");
        assert_eq!(notice.task.id, task.id);
        assert_eq!(second.recv().await.unwrap().data, json!({"step": 1}));
    }

    #[test]
    fn test_notify_without_observers_is_ignored() {
        let observers = AgentObservers::new();
        observers.notify("a", &Task::new("t", ""), "noop", Value::Null);
        assert_eq!(observers.observer_count(), 0);
    }
}
