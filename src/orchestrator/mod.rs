//! Composition root: agent registry, submission queue, bounded worker
//! pool, approval and cancellation workflow, and the event bus.
//!
//! Per-task state machine:
//! `Pending -> [ApprovalRequired -> Pending] -> Running -> Completed | Failed | Cancelled`.
//!
//! All shared state lives behind one mutex that is never held across an
//! `.await`. Structural errors are returned from the call that caused them;
//! execution failures are recorded on the task and published as events.

mod event;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentInfo};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::events::{EventBus, ObserverId};
use crate::execution::{ExecutionContext, ExecutionEngine, ProgressCallback};
use crate::plan::{CompletionStatus, Plan};
use crate::task::{Task, TaskContext, TaskResult, TaskStatus};

pub use event::{EventKind, OrchestratorEvent};

struct QueueItem {
    task_id: String,
    context: TaskContext,
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    forwarder: JoinHandle<()>,
}

/// Handle on an in-flight execution unit
struct ActiveUnit {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Workers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    /// Registration order is routing order
    agents: Vec<RegisteredAgent>,
    tasks: HashMap<String, Task>,
    active: HashMap<String, ActiveUnit>,
    workers: Option<Workers>,
}

impl State {
    fn agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .iter()
            .find(|r| r.agent.id() == agent_id)
            .map(|r| r.agent.clone())
    }
}

struct Shared {
    config: OrchestratorConfig,
    engine: ExecutionEngine,
    state: Mutex<State>,
    events: EventBus<OrchestratorEvent>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>,
    slots: Arc<Semaphore>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

impl Orchestrator {
    /// Create an orchestrator. Workers are not started until [`start`](Self::start).
    pub fn new(config: OrchestratorConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let workers = config.max_concurrent_tasks.max(1);
        let shared = Shared {
            engine: ExecutionEngine::new(config.finished_retention, config.event_capacity),
            state: Mutex::new(State::default()),
            events: EventBus::new(config.event_capacity),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            slots: Arc::new(Semaphore::new(workers)),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Configuration this orchestrator was created with
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Engine used for every execution, for log and stats lookups
    pub fn engine(&self) -> &ExecutionEngine {
        &self.shared.engine
    }

    // ========================================
    // Agent registry
    // ========================================

    /// Register an agent and start republishing its notices as
    /// `agent_<event>` events. Must be called within a Tokio runtime.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<(), OrchestratorError> {
        let mut state = self.shared.state.lock();
        let agent_id = agent.id().to_string();
        if state.agent(&agent_id).is_some() {
            return Err(OrchestratorError::AlreadyRegistered(agent_id));
        }

        let forwarder = spawn_notice_forwarder(Arc::downgrade(&self.shared), agent.as_ref());
        state.agents.push(RegisteredAgent { agent, forwarder });
        info!(agent_id = %agent_id, "Agent registered");
        Ok(())
    }

    /// Remove an agent. Returns false if it was not registered.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let Some(index) = state.agents.iter().position(|r| r.agent.id() == agent_id) else {
            return false;
        };
        let removed = state.agents.remove(index);
        removed.forwarder.abort();
        info!(agent_id, "Agent unregistered");
        true
    }

    /// Look up a registered agent
    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.shared.state.lock().agent(agent_id)
    }

    /// Registered agents in registration order
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.shared
            .state
            .lock()
            .agents
            .iter()
            .map(|r| r.agent.info().clone())
            .collect()
    }

    // ========================================
    // Submission and workflow
    // ========================================

    /// Accept a task for execution and return its id.
    ///
    /// A task without an agent is bound to the first registered agent that
    /// can handle it. On error nothing is recorded.
    pub fn submit(
        &self,
        mut task: Task,
        context: Option<TaskContext>,
    ) -> Result<String, OrchestratorError> {
        if task.agent_id.is_empty() {
            let agents: Vec<Arc<dyn Agent>> = self
                .shared
                .state
                .lock()
                .agents
                .iter()
                .map(|r| r.agent.clone())
                .collect();
            let agent = agents
                .iter()
                .find(|a| a.can_handle(&task))
                .ok_or_else(|| OrchestratorError::NoSuitableAgent(task.id.clone()))?;
            task.agent_id = agent.id().to_string();
        }

        let mut context = context.unwrap_or_default();
        context.add_to_history(
            "submitted",
            json!({"task_id": task.id, "agent_id": task.agent_id}),
        );

        let snapshot = {
            let mut state = self.shared.state.lock();
            if state.agent(&task.agent_id).is_none() {
                return Err(OrchestratorError::AgentNotFound(task.agent_id));
            }
            if let Some(existing) = state.tasks.get(&task.id) {
                if !existing.is_terminal() {
                    return Err(OrchestratorError::AlreadyRegistered(task.id));
                }
            }
            task.reset_for_submit();
            self.shared.enqueue(&task.id, context)?;
            state.tasks.insert(task.id.clone(), task.clone());
            task
        };

        info!(task_id = %snapshot.id, agent_id = %snapshot.agent_id, "Task submitted");
        let id = snapshot.id.clone();
        self.shared.emit(EventKind::TaskSubmitted, snapshot, Value::Null);
        Ok(id)
    }

    /// Approve a task parked in `ApprovalRequired` and queue it again.
    /// Returns false without changing anything for any other status.
    pub fn approve(&self, task_id: &str, user_id: &str) -> bool {
        let snapshot = {
            let mut state = self.shared.state.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::ApprovalRequired {
                return false;
            }

            let mut context = TaskContext::with_user(user_id);
            context.add_to_history("approved", json!({"task_id": task_id, "approved_by": user_id}));
            if let Err(e) = self.shared.enqueue(task_id, context) {
                warn!(task_id, "Failed to queue approved task: {}", e);
                return false;
            }
            task.approved_by = Some(user_id.to_string());
            task.set_status(TaskStatus::Pending);
            task.clone()
        };

        info!(task_id, approved_by = user_id, "Task approved");
        self.shared.emit(
            EventKind::TaskApproved,
            snapshot,
            json!({"approved_by": user_id}),
        );
        true
    }

    /// Cancel a task.
    ///
    /// Queued and parked tasks are cancelled immediately and skipped when
    /// dequeued. A running task is signalled and this call waits until its
    /// execution unit has stopped. Returns false for unknown or already
    /// finished tasks.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut done = {
            let mut state = self.shared.state.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            let status = task.status;
            match status {
                TaskStatus::Pending | TaskStatus::ApprovalRequired => {
                    task.set_status(TaskStatus::Cancelled);
                    let snapshot = task.clone();
                    drop(state);
                    info!(task_id, "Queued task cancelled");
                    self.shared
                        .emit(EventKind::TaskCancelled, snapshot, Value::Null);
                    return true;
                }
                TaskStatus::Running => match state.active.get(task_id) {
                    Some(unit) => {
                        unit.token.cancel();
                        unit.done.clone()
                    }
                    None => {
                        warn!(task_id, "Running task has no execution unit");
                        return false;
                    }
                },
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => return false,
            }
        };

        debug!(task_id, "Waiting for execution unit to stop");
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }

        self.shared
            .state
            .lock()
            .tasks
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::Cancelled)
    }

    /// Snapshot of a submitted task
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.shared.state.lock().tasks.get(task_id).cloned()
    }

    /// Tasks matching the filters, newest first, then paginated
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        agent_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .shared
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| agent_id.map_or(true, |a| t.agent_id == a))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks.into_iter().skip(offset).take(limit).collect()
    }

    /// Forward in-flight progress to a running task
    pub fn report_progress(&self, task_id: &str, progress: f64) -> Option<f64> {
        self.shared.engine.report_progress(task_id, progress)
    }

    /// Wait until a task reaches a terminal status
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<Task, OrchestratorError> {
        self.wait_until(task_id, timeout, Task::is_terminal).await
    }

    async fn wait_until(
        &self,
        task_id: &str,
        timeout: Duration,
        done: impl Fn(&Task) -> bool,
    ) -> Result<Task, OrchestratorError> {
        let mut rx = self.shared.events.subscribe();
        let wait = async {
            loop {
                match self.get_task(task_id) {
                    Some(task) if done(&task) => return Ok(task),
                    Some(_) => {}
                    None => return Err(OrchestratorError::NotFound(task_id.to_string())),
                }
                match rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(OrchestratorError::QueueClosed)
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout.as_secs_f64()))?
    }

    // ========================================
    // Worker pool
    // ========================================

    /// Start the worker pool. Does nothing if already running.
    /// Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.workers.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let count = self.shared.config.max_concurrent_tasks.max(1);
        let handles = (0..count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    self.shared.clone(),
                    worker_id,
                    shutdown.clone(),
                ))
            })
            .collect();
        state.workers = Some(Workers { shutdown, handles });
        info!(workers = count, "Orchestrator started");
    }

    /// Whether the worker pool is running
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().workers.is_some()
    }

    /// Stop the workers, cancel every running task and wait for all of them.
    /// Queued tasks stay queued for the next `start`.
    pub async fn stop(&self) {
        let Some(workers) = self.shared.state.lock().workers.take() else {
            return;
        };
        workers.shutdown.cancel();
        for handle in workers.handles {
            let _ = handle.await;
        }

        // No worker is left to dispatch, so the active set is final
        let units: Vec<watch::Receiver<bool>> = self
            .shared
            .state
            .lock()
            .active
            .values()
            .map(|unit| {
                unit.token.cancel();
                unit.done.clone()
            })
            .collect();
        for mut done in units {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.shared.state.lock().active.clear();
        info!("Orchestrator stopped");
    }

    // ========================================
    // Observers
    // ========================================

    /// Run `callback` for every event. Errors and panics inside the
    /// callback are logged and never reach the emitter.
    pub fn add_observer<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&OrchestratorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.events.add_observer(callback)
    }

    /// Stop an observer. Returns false if it was already removed.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.events.remove_observer(id)
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    // ========================================
    // Plans
    // ========================================

    /// Run a plan batch by batch, writing every outcome back into it.
    ///
    /// Tasks parked for approval are approved as `approver` when given.
    /// Execution stops after the first batch that does not fully complete;
    /// later tasks are left pending. If a submission fails, the tasks of
    /// that batch already submitted are awaited and written back before
    /// the error is returned.
    pub async fn execute_plan(
        &self,
        plan: &mut Plan,
        approver: Option<&str>,
        task_timeout: Duration,
    ) -> Result<CompletionStatus, OrchestratorError> {
        let batches: Vec<Vec<String>> = plan.execution_batches().to_vec();

        for (index, batch) in batches.iter().enumerate() {
            let mut submitted = Vec::with_capacity(batch.len());
            let mut submit_error = None;
            for task_id in batch {
                let Some(task) = plan.get_task(task_id) else {
                    continue;
                };
                if task.status == TaskStatus::Completed {
                    continue;
                }
                let mut context = TaskContext::new();
                context
                    .metadata
                    .insert("plan_id".into(), json!(plan.id));
                match self.submit(task.clone(), Some(context)) {
                    Ok(id) => submitted.push(id),
                    Err(err) => {
                        submit_error = Some(err);
                        break;
                    }
                }
            }

            let mut batch_ok = submit_error.is_none();
            for task_id in &submitted {
                let parked = |t: &Task| t.is_terminal() || t.status == TaskStatus::ApprovalRequired;
                let mut task = self.wait_until(task_id, task_timeout, parked).await?;
                if task.status == TaskStatus::ApprovalRequired {
                    if let Some(user) = approver {
                        self.approve(task_id, user);
                        task = self.wait_for(task_id, task_timeout).await?;
                    }
                }
                batch_ok &= task.status == TaskStatus::Completed;
                plan.update_task(task)?;
            }

            if let Some(err) = submit_error {
                warn!(plan_id = %plan.id, batch = index, error = %err, "Plan batch submission failed");
                return Err(err);
            }
            info!(plan_id = %plan.id, batch = index, ok = batch_ok, "Plan batch finished");
            if !batch_ok {
                break;
            }
        }

        Ok(plan.completion_status())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(workers) = state.workers.take() {
            workers.shutdown.cancel();
        }
        for unit in state.active.values() {
            unit.token.cancel();
        }
        for registered in &state.agents {
            registered.forwarder.abort();
        }
    }
}

impl Shared {
    fn enqueue(&self, task_id: &str, context: TaskContext) -> Result<(), OrchestratorError> {
        self.queue_tx
            .send(QueueItem {
                task_id: task_id.to_string(),
                context,
            })
            .map_err(|_| OrchestratorError::QueueClosed)
    }

    fn emit(&self, kind: EventKind, task: Task, data: Value) {
        let receivers = self.events.publish(OrchestratorEvent::new(kind.clone(), task, data));
        debug!(event = %kind, receivers, "Event published");
    }

    /// Handle one dequeued item. Runs on a worker; never awaits.
    fn dispatch(
        self: &Arc<Self>,
        worker_id: usize,
        item: QueueItem,
        permit: OwnedSemaphorePermit,
    ) {
        let QueueItem {
            task_id,
            mut context,
        } = item;

        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(&task_id) else {
            warn!(task_id = %task_id, "Dequeued unknown task");
            return;
        };

        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Cancelled => {
                debug!(task_id = %task_id, "Skipping cancelled task");
                return;
            }
            status => {
                debug!(task_id = %task_id, %status, "Skipping stale queue entry");
                return;
            }
        }

        if task.awaiting_approval() {
            task.set_status(TaskStatus::ApprovalRequired);
            let snapshot = task.clone();
            drop(state);
            info!(task_id = %task_id, "Task awaiting approval");
            self.emit(EventKind::TaskRequiresApproval, snapshot, Value::Null);
            return;
        }

        let agent_id = task.agent_id.clone();
        let Some(agent) = state.agent(&agent_id) else {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            task.error = Some(OrchestratorError::AgentNotFound(agent_id.clone()).to_string());
            task.set_status(TaskStatus::Failed);
            let snapshot = task.clone();
            drop(state);
            warn!(task_id = %task_id, agent_id = %agent_id, "Agent disappeared before dispatch");
            self.emit(EventKind::TaskFailed, snapshot, Value::Null);
            return;
        };

        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };
        task.set_status(TaskStatus::Running);
        let snapshot = task.clone();
        context.add_to_history(
            "dispatched",
            json!({"task_id": task_id, "agent_id": agent_id, "worker": worker_id}),
        );

        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        state.active.insert(
            task_id.clone(),
            ActiveUnit {
                token: token.clone(),
                done: done_rx,
            },
        );
        drop(state);

        info!(task_id = %task_id, agent_id = %agent_id, worker = worker_id, "Task started");
        self.emit(EventKind::TaskStarted, snapshot.clone(), Value::Null);

        let unit = ExecutionUnit {
            shared: self.clone(),
            task: snapshot,
            agent,
            context,
            token,
            done: done_tx,
            _permit: permit,
        };
        tokio::spawn(unit.run());
    }

    /// Record the outcome of a unit. Returns the event to publish.
    fn finish(&self, task_id: &str, outcome: Option<TaskResult>) -> Option<(EventKind, Task, Value)> {
        let mut state = self.state.lock();
        state.active.remove(task_id);
        let task = state.tasks.get_mut(task_id)?;

        let (kind, data) = match outcome {
            None => {
                task.set_status(TaskStatus::Cancelled);
                (EventKind::TaskCancelled, Value::Null)
            }
            Some(result) => {
                task.output_data = result.data.clone();
                task.error = result.error.clone();
                let data = json!({
                    "execution_time": result.execution_time.as_secs_f64(),
                    "result": result,
                });
                if result.success {
                    task.set_status(TaskStatus::Completed);
                    (EventKind::TaskCompleted, data)
                } else {
                    task.set_status(TaskStatus::Failed);
                    (EventKind::TaskFailed, data)
                }
            }
        };
        Some((kind, task.clone(), data))
    }
}

/// One task execution, spawned by a worker and tracked in the active map
struct ExecutionUnit {
    shared: Arc<Shared>,
    task: Task,
    agent: Arc<dyn Agent>,
    context: TaskContext,
    token: CancellationToken,
    done: watch::Sender<bool>,
    _permit: OwnedSemaphorePermit,
}

impl ExecutionUnit {
    async fn run(self) {
        let task_id = self.task.id.clone();
        let shared = self.shared;
        let mut ctx = ExecutionContext::new(self.task, self.agent, self.context)
            .with_limits(shared.config.resource_limits.clone())
            .with_policy(shared.config.security_policy.clone());

        let progress: ProgressCallback = {
            let weak = Arc::downgrade(&shared);
            let task_id = task_id.clone();
            Arc::new(move |value| {
                if let Some(shared) = weak.upgrade() {
                    if let Some(task) = shared.state.lock().tasks.get_mut(&task_id) {
                        task.report_progress(value);
                    }
                }
            })
        };

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            result = shared.engine.run(&mut ctx, Some(progress)) => Some(result),
        };

        match shared.finish(&task_id, outcome) {
            Some((kind, task, data)) => {
                info!(task_id = %task_id, status = %task.status, "Task finished");
                shared.emit(kind, task, data);
            }
            None => warn!(task_id = %task_id, "Finished task is no longer tracked"),
        }
        let _ = self.done.send(true);
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize, shutdown: CancellationToken) {
    debug!(worker = worker_id, "Worker started");
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = shared.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let item = {
            let mut rx = tokio::select! {
                _ = shutdown.cancelled() => break,
                rx = shared.queue_rx.lock() => rx,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => item,
            }
        };

        match item {
            Some(item) => shared.dispatch(worker_id, item, permit),
            None => break,
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

fn spawn_notice_forwarder(shared: Weak<Shared>, agent: &dyn Agent) -> JoinHandle<()> {
    let mut notices = agent.observers().subscribe();
    let agent_id = agent.id().to_string();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    shared.emit(
                        EventKind::Agent(notice.event),
                        notice.task,
                        json!({"agent_id": notice.agent_id, "data": notice.data}),
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(agent_id = %agent_id, lagged = n, "Agent notices dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
