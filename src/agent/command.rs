use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{Agent, AgentInfo, AgentObservers, Requirements};
use crate::task::{DataMap, Task, TaskContext, TaskResult};

/// External program wrapped by a [`CommandAgent`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Task types routed to this agent (matched against `input_data.task_type`)
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub filesystem: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            description: String::new(),
            task_types: Vec::new(),
            working_dir: None,
            network: false,
            filesystem: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Runs one external process per task.
///
/// Extra arguments come from the task's `input_data.args` array. The
/// process is killed when the execution is dropped, so cancellation and
/// timeouts do not leave it running.
pub struct CommandAgent {
    info: AgentInfo,
    spec: CommandSpec,
    observers: AgentObservers,
}

impl CommandAgent {
    pub fn new(id: impl Into<String>, spec: CommandSpec) -> Self {
        let id = id.into();
        let info = AgentInfo {
            id: id.clone(),
            name: id,
            description: spec.description.clone(),
            capabilities: vec!["subprocess".into()],
            supported_task_types: spec.task_types.clone(),
        };
        Self {
            info,
            spec,
            observers: AgentObservers::new(),
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn arguments(&self, task: &Task) -> Vec<String> {
        let mut args = self.spec.args.clone();
        if let Some(Value::Array(extra)) = task.input_data.get("args") {
            args.extend(extra.iter().map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }));
        }
        args
    }

    fn working_dir(&self, task: &Task) -> Option<PathBuf> {
        task.input_data
            .get("working_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .or_else(|| self.spec.working_dir.clone())
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<String> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected
}

#[async_trait]
impl Agent for CommandAgent {
    fn info(&self) -> &AgentInfo {
        &self.info
    }

    async fn execute(&self, task: &Task, _context: &TaskContext) -> Result<TaskResult> {
        let args = self.arguments(task);

        let mut command = Command::new(&self.spec.command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir(task) {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", self.spec.command))?;
        debug!(task_id = %task.id, agent_id = %self.info.id, pid = ?child.id(), "Process spawned");
        self.notify_observers(
            task,
            "spawned",
            json!({"command": self.spec.command, "args": args, "pid": child.id()}),
        );

        let (stdout, stderr) = tokio::join!(
            collect_lines(child.stdout.take()),
            collect_lines(child.stderr.take())
        );
        let status = child.wait().await.context("Failed to wait for process")?;

        self.notify_observers(task, "exited", json!({"exit_code": status.code()}));

        let mut data = DataMap::new();
        data.insert("exit_code".into(), json!(status.code()));
        data.insert("stdout".into(), json!(stdout));
        data.insert("stderr".into(), json!(stderr));

        if status.success() {
            Ok(TaskResult::ok(&task.id, data))
        } else {
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let message = match stderr.last() {
                Some(line) => format!("Process exited with {}: {}", code, line),
                None => format!("Process exited with {}", code),
            };
            let mut result = TaskResult::failed(&task.id, message);
            result.data = Some(data);
            Ok(result)
        }
    }

    fn can_handle(&self, task: &Task) -> bool {
        match task.task_type() {
            Some(kind) => kind == self.info.id || self.spec.task_types.iter().any(|t| t == kind),
            None => false,
        }
    }

    fn requirements(&self, _task: &Task) -> Requirements {
        Requirements {
            network: self.spec.network,
            filesystem: self.spec.filesystem,
            subprocesses: 1,
            ..Requirements::default()
        }
    }

    fn observers(&self) -> &AgentObservers {
        &self.observers
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str) -> CommandAgent {
        CommandAgent::new("sh", CommandSpec::new("sh").with_args(["-c", script]))
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let agent = shell("echo hello; echo world");
        let task = Task::new("greet", "");
        let result = agent.execute(&task, &TaskContext::new()).await.unwrap();

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["stdout"], json!(["hello", "world"]));
        assert_eq!(data["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit_code() {
        let agent = shell("echo broken >&2; exit 3");
        let task = Task::new("fail", "");
        let result = agent.execute(&task, &TaskContext::new()).await.unwrap();

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error, "Process exited with 3: broken");
        assert_eq!(result.data.unwrap()["stderr"], json!(["broken"]));
    }

    #[tokio::test]
    async fn test_task_args_are_appended() {
        let agent = CommandAgent::new("echo", CommandSpec::new("echo").with_args(["-n"]));
        let task = Task::new("t", "").with_input("args", json!(["a", 1]));
        let result = agent.execute(&task, &TaskContext::new()).await.unwrap();
        assert_eq!(result.data.unwrap()["stdout"], json!(["a 1"]));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let agent = CommandAgent::new("ghost", CommandSpec::new("definitely-not-a-real-binary"));
        let err = agent
            .execute(&Task::new("t", ""), &TaskContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to start"));
    }

    #[tokio::test]
    async fn test_dropping_execution_kills_process() {
        let agent = shell("sleep 5");
        let task = Task::new("slow", "");
        let context = TaskContext::new();
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), agent.execute(&task, &context)).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_spawn_and_exit_notices() {
        let agent = shell("true");
        let mut notices = agent.observers().subscribe();
        let task = Task::new("t", "");
        agent.execute(&task, &TaskContext::new()).await.unwrap();

        assert_eq!(notices.recv().await.unwrap().event, "spawned");
        let exited = notices.recv().await.unwrap();
        assert_eq!(exited.event, "exited");
        assert_eq!(exited.data["exit_code"], json!(0));
    }

    #[test]
    fn test_can_handle_matches_task_type() {
        let mut spec = CommandSpec::new("trivy");
        spec.task_types = vec!["security_scan".into()];
        let agent = CommandAgent::new("scanner", spec);

        assert!(agent.can_handle(&Task::new("t", "").with_input("task_type", "security_scan")));
        assert!(agent.can_handle(&Task::new("t", "").with_input("task_type", "scanner")));
        assert!(!agent.can_handle(&Task::new("t", "").with_input("task_type", "restart")));
        assert!(!agent.can_handle(&Task::new("t", "")));
        assert_eq!(agent.requirements(&Task::new("t", "")).subprocesses, 1);
    }
}
