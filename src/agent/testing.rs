//! Scripted agents for exercising the orchestration core in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Agent, AgentInfo, AgentObservers, Requirements};
use crate::task::{DataMap, Task, TaskContext, TaskResult};

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    Error(String),
    Panic,
    Sleep(Duration),
}

pub struct ScriptedAgent {
    info: AgentInfo,
    observers: AgentObservers,
    behavior: Behavior,
    handles: bool,
    requirements: Requirements,
    pub calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(id: &str, behavior: Behavior) -> Self {
        Self {
            info: AgentInfo::new(id, format!("{} agent", id)),
            observers: AgentObservers::new(),
            behavior,
            handles: true,
            requirements: Requirements::default(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(id: &str) -> Self {
        Self::new(id, Behavior::Succeed)
    }

    pub fn sleeping(id: &str, duration: Duration) -> Self {
        Self::new(id, Behavior::Sleep(duration))
    }

    pub fn refusing(mut self) -> Self {
        self.handles = false;
        self
    }

    pub fn requiring(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn info(&self) -> &AgentInfo {
        &self.info
    }

    async fn execute(&self, task: &Task, _context: &TaskContext) -> anyhow::Result<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.notify_observers(task, "started", Value::Null);

        match &self.behavior {
            Behavior::Succeed => {
                let mut data = DataMap::new();
                data.insert("handled_by".into(), json!(self.info.id));
                Ok(TaskResult::ok(&task.id, data))
            }
            Behavior::Fail(msg) => Ok(TaskResult::failed(&task.id, msg.clone())),
            Behavior::Error(msg) => Err(anyhow::anyhow!(msg.clone())),
            Behavior::Panic => panic!("scripted agent panicked"),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(TaskResult::ok(&task.id, DataMap::new()))
            }
        }
    }

    fn can_handle(&self, _task: &Task) -> bool {
        self.handles
    }

    fn requirements(&self, _task: &Task) -> Requirements {
        self.requirements.clone()
    }

    fn observers(&self) -> &AgentObservers {
        &self.observers
    }
}
