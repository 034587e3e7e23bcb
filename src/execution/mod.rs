//! Budgeted execution of a single agent invocation.
//!
//! [`ExecutionEngine::run`] races the agent against the wall-clock timeout,
//! checks the security policy through a [`Sandbox`], keeps a structured
//! per-task log and attaches [`ExecutionStats`] to the result. It can be
//! used on its own or underneath the orchestrator.

mod limits;
mod log;
mod sandbox;
mod stats;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::agent::Agent;
use crate::error::OrchestratorError;
use crate::events::{EventBus, ObserverId, DEFAULT_CAPACITY};
use crate::task::{Task, TaskContext, TaskResult, TaskStatus, MAX_IN_FLIGHT_PROGRESS};

pub use limits::{ResourceLimits, SecurityPolicy};
pub use log::{ExecutionLogger, LogEntry, LogLevel};
pub use sandbox::{PolicyReport, PolicySandbox, Sandbox};
pub use stats::{ExecutionStats, STATS_KEY};

/// Number of finished executions kept for introspection
pub const DEFAULT_RETENTION: usize = 64;

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
}

/// Event published on the engine's own bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: ExecutionEventKind,
    pub task_id: String,
    pub agent_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct ProgressState {
    value: f64,
    callback: Option<ProgressCallback>,
}

/// Shared progress slot so progress can be reported while `run` holds the context
#[derive(Clone, Default)]
struct ProgressTracker(Arc<Mutex<ProgressState>>);

impl ProgressTracker {
    fn set(&self, value: f64) -> f64 {
        let (value, callback) = {
            let mut state = self.0.lock();
            if !value.is_nan() {
                state.value = value.clamp(0.0, MAX_IN_FLIGHT_PROGRESS);
            }
            (state.value, state.callback.clone())
        };
        if let Some(callback) = callback {
            callback(value);
        }
        value
    }

    fn get(&self) -> f64 {
        self.0.lock().value
    }

    fn set_callback(&self, callback: Option<ProgressCallback>) {
        self.0.lock().callback = callback;
    }
}

/// Everything one execution needs
pub struct ExecutionContext {
    pub task: Task,
    pub agent: Arc<dyn Agent>,
    pub agent_context: TaskContext,
    pub limits: ResourceLimits,
    pub policy: SecurityPolicy,
    pub stats: ExecutionStats,
    pub logger: ExecutionLogger,
    progress: ProgressTracker,
}

impl ExecutionContext {
    pub fn new(task: Task, agent: Arc<dyn Agent>, agent_context: TaskContext) -> Self {
        let logger = ExecutionLogger::new(&task.id, agent.id());
        let progress = ProgressTracker::default();
        progress.set(task.progress);
        Self {
            task,
            agent,
            agent_context,
            limits: ResourceLimits::default(),
            policy: SecurityPolicy::default(),
            stats: ExecutionStats::default(),
            logger,
            progress,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record in-flight progress and notify the progress callback
    pub fn set_progress(&mut self, progress: f64) -> f64 {
        let value = self.progress.set(progress);
        self.task.report_progress(value)
    }
}

/// Snapshot of a running execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub task_id: String,
    pub agent_id: String,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub progress: f64,
    pub execution_time: f64,
}

struct ActiveEntry {
    agent_id: String,
    task_name: String,
    start_time: DateTime<Utc>,
    logger: ExecutionLogger,
    progress: ProgressTracker,
}

struct FinishedEntry {
    task_id: String,
    stats: ExecutionStats,
    logger: ExecutionLogger,
}

#[derive(Default)]
struct EngineState {
    active: HashMap<String, ActiveEntry>,
    finished: VecDeque<FinishedEntry>,
}

/// Removes the execution from the active set when `run` returns or its
/// future is dropped mid-flight.
struct ActiveGuard<'a> {
    engine: &'a ExecutionEngine,
    task_id: String,
    logger: ExecutionLogger,
    start_time: DateTime<Utc>,
    stats: Option<ExecutionStats>,
}

impl ActiveGuard<'_> {
    fn complete(mut self, stats: ExecutionStats) {
        self.stats = Some(stats);
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let stats = match self.stats.take() {
            Some(stats) => stats,
            None => {
                self.logger.warning("Execution abandoned before completion");
                let mut stats = ExecutionStats {
                    start_time: Some(self.start_time),
                    ..ExecutionStats::default()
                };
                stats.finish(
                    self.logger.count(LogLevel::Error),
                    self.logger.count(LogLevel::Warning),
                );
                stats
            }
        };
        self.engine.retire(&self.task_id, stats, self.logger.clone());
    }
}

pub struct ExecutionEngine {
    sandbox: Arc<dyn Sandbox>,
    retention: usize,
    state: Mutex<EngineState>,
    events: EventBus<ExecutionEvent>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_CAPACITY)
    }
}

impl ExecutionEngine {
    pub fn new(retention: usize, event_capacity: usize) -> Self {
        Self {
            sandbox: Arc::new(PolicySandbox),
            retention,
            state: Mutex::new(EngineState::default()),
            events: EventBus::new(event_capacity),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Execute the context's task with its agent.
    ///
    /// Never returns an error: timeouts, faults and policy violations
    /// produce an unsuccessful result and leave the task `Failed`.
    /// Dropping the returned future abandons the agent call.
    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        progress_callback: Option<ProgressCallback>,
    ) -> TaskResult {
        let task_id = ctx.task.id.clone();
        let agent_id = ctx.agent.id().to_string();

        ctx.progress.set_callback(progress_callback);
        ctx.stats.start();
        let start_time = ctx.stats.start_time.unwrap_or_else(Utc::now);
        let guard = self.track(ctx, start_time);

        ctx.logger.info(format!(
            "Starting execution of task {} with agent {}",
            task_id, agent_id
        ));
        self.publish(
            ExecutionEventKind::TaskStarted,
            &task_id,
            &agent_id,
            json!({"start_time": start_time, "resource_limits": ctx.limits}),
        );
        ctx.task.set_status(TaskStatus::Running);

        let outcome = self.invoke(ctx).await;
        ctx.task.report_progress(ctx.progress.get());

        self.sandbox.measure(&mut ctx.stats);
        let outcome = outcome.and_then(|result| self.check_measured(ctx, result));

        let mut result = match outcome {
            Ok(mut result) => {
                result.task_id = task_id.clone();
                ctx.logger.info(format!(
                    "Task execution completed with success={}",
                    result.success
                ));
                if !result.success {
                    if let Some(error) = &result.error {
                        ctx.logger.warning(format!("Agent reported failure: {}", error));
                    }
                }
                result
            }
            Err(err) => {
                ctx.logger.error(format!("Task execution failed: {}", err));
                TaskResult::failed(&task_id, err.to_string())
            }
        };

        ctx.stats.finish(
            ctx.logger.count(LogLevel::Error),
            ctx.logger.count(LogLevel::Warning),
        );
        result.execution_time = Duration::from_secs_f64(ctx.stats.execution_time);
        result.insert_data(
            STATS_KEY,
            serde_json::to_value(&ctx.stats).unwrap_or(Value::Null),
        );

        ctx.task.error = result.error.clone();
        ctx.task.output_data = result.data.clone();
        ctx.task.set_status(if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        });

        let kind = if result.success {
            ExecutionEventKind::TaskCompleted
        } else {
            ExecutionEventKind::TaskFailed
        };
        self.publish(
            kind,
            &task_id,
            &agent_id,
            json!({
                "execution_time": ctx.stats.execution_time,
                "result": result,
                "stats": ctx.stats,
            }),
        );

        guard.complete(ctx.stats.clone());
        result
    }

    async fn invoke(&self, ctx: &ExecutionContext) -> Result<TaskResult, OrchestratorError> {
        let requirements = ctx.agent.requirements(&ctx.task);
        let report = self.sandbox.check(&requirements, &ctx.limits, &ctx.policy);
        for warning in &report.warnings {
            ctx.logger.debug(warning.as_str());
        }
        if let Some(violation) = report.violation() {
            return Err(OrchestratorError::PolicyViolation(violation));
        }

        let timeout = ctx.limits.wall_clock_timeout;
        ctx.logger.info(format!(
            "Executing task with timeout of {}s",
            timeout.as_secs_f64()
        ));
        let call = AssertUnwindSafe(ctx.agent.execute(&ctx.task, &ctx.agent_context)).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(OrchestratorError::Timeout(timeout.as_secs_f64())),
            Ok(Err(panic)) => Err(OrchestratorError::ExecutionFault(panic_message(&*panic))),
            Ok(Ok(Err(e))) => Err(OrchestratorError::ExecutionFault(format!("{:#}", e))),
            Ok(Ok(Ok(result))) => Ok(result),
        }
    }

    /// Apply ceilings to whatever the sandbox measured
    fn check_measured(
        &self,
        ctx: &ExecutionContext,
        result: TaskResult,
    ) -> Result<TaskResult, OrchestratorError> {
        if let Some(ceiling) = ctx.limits.memory_ceiling_mb {
            if ctx.stats.memory_peak_mb > ceiling as f64 {
                return Err(OrchestratorError::PolicyViolation(format!(
                    "memory peak {:.1} MB exceeded ceiling of {} MB",
                    ctx.stats.memory_peak_mb, ceiling
                )));
            }
        }
        if let Some(cpu) = ctx.limits.cpu_time {
            if ctx.stats.cpu_time > cpu.as_secs_f64() {
                return Err(OrchestratorError::PolicyViolation(format!(
                    "cpu time {:.2}s exceeded ceiling of {}s",
                    ctx.stats.cpu_time,
                    cpu.as_secs_f64()
                )));
            }
        }
        Ok(result)
    }

    fn track(&self, ctx: &ExecutionContext, start_time: DateTime<Utc>) -> ActiveGuard<'_> {
        self.state.lock().active.insert(
            ctx.task.id.clone(),
            ActiveEntry {
                agent_id: ctx.agent.id().to_string(),
                task_name: ctx.task.name.clone(),
                start_time,
                logger: ctx.logger.clone(),
                progress: ctx.progress.clone(),
            },
        );
        ActiveGuard {
            engine: self,
            task_id: ctx.task.id.clone(),
            logger: ctx.logger.clone(),
            start_time,
            stats: None,
        }
    }

    fn retire(&self, task_id: &str, stats: ExecutionStats, logger: ExecutionLogger) {
        let mut state = self.state.lock();
        state.active.remove(task_id);
        state.finished.retain(|f| f.task_id != task_id);
        if self.retention == 0 {
            return;
        }
        while state.finished.len() >= self.retention {
            state.finished.pop_front();
        }
        state.finished.push_back(FinishedEntry {
            task_id: task_id.to_string(),
            stats,
            logger,
        });
    }

    fn publish(&self, kind: ExecutionEventKind, task_id: &str, agent_id: &str, data: Value) {
        let receivers = self.events.publish(ExecutionEvent {
            kind,
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            data,
            timestamp: Utc::now(),
        });
        debug!(task_id, ?kind, receivers, "Execution event published");
    }

    /// Stats of a running (partial) or recently finished execution
    pub fn get_task_stats(&self, task_id: &str) -> Option<ExecutionStats> {
        let state = self.state.lock();
        if let Some(active) = state.active.get(task_id) {
            let mut stats = ExecutionStats {
                start_time: Some(active.start_time),
                ..ExecutionStats::default()
            };
            stats.execution_time = stats.elapsed();
            return Some(stats);
        }
        state
            .finished
            .iter()
            .find(|f| f.task_id == task_id)
            .map(|f| f.stats.clone())
    }

    pub fn get_active_tasks(&self) -> Vec<ActiveExecution> {
        let now = Utc::now();
        let mut active: Vec<ActiveExecution> = self
            .state
            .lock()
            .active
            .iter()
            .map(|(task_id, entry)| ActiveExecution {
                task_id: task_id.clone(),
                agent_id: entry.agent_id.clone(),
                task_name: entry.task_name.clone(),
                start_time: entry.start_time,
                progress: entry.progress.get(),
                execution_time: (now - entry.start_time)
                    .to_std()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0),
            })
            .collect();
        active.sort_by_key(|a| a.start_time);
        active
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.state.lock().active.contains_key(task_id)
    }

    /// Logs of a running or recently finished execution; empty otherwise
    pub fn get_task_logs(
        &self,
        task_id: &str,
        level: Option<LogLevel>,
        limit: usize,
        offset: usize,
    ) -> Vec<LogEntry> {
        let logger = {
            let state = self.state.lock();
            match state.active.get(task_id) {
                Some(active) => Some(active.logger.clone()),
                None => state
                    .finished
                    .iter()
                    .find(|f| f.task_id == task_id)
                    .map(|f| f.logger.clone()),
            }
        };
        logger
            .map(|l| l.get_logs(level, limit, offset))
            .unwrap_or_default()
    }

    /// Report progress for a running execution. Returns the stored value,
    /// or `None` if the task is not running here.
    pub fn report_progress(&self, task_id: &str, progress: f64) -> Option<f64> {
        let tracker = self
            .state
            .lock()
            .active
            .get(task_id)
            .map(|a| a.progress.clone())?;
        Some(tracker.set(progress))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn add_observer<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.add_observer(callback)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.events.remove_observer(id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("agent panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("agent panicked: {}", msg)
    } else {
        "agent panicked".to_string()
    }
}
