use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::graph::{self, DependencyMap};
use crate::error::PlanError;
use crate::task::{DataMap, Task, TaskStatus};

/// Relationship between two tasks of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// `from` is a subtask of `to`
    Subtask,
    /// `from` can only start once `to` has completed
    DependsOn,
    /// `from` blocks `to` (informational)
    Blocks,
    /// Loose association, no ordering
    RelatedTo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from_task_id: String,
    pub to_task_id: String,
    pub kind: RelationKind,
    #[serde(default)]
    pub metadata: DataMap,
}

/// Aggregated progress of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub approval_required_tasks: usize,
    pub completion_percentage: f64,
    /// Every task reached a terminal status
    pub is_complete: bool,
    /// Every task completed, none failed or were cancelled
    pub is_successful: bool,
}

/// A DAG of tasks plus the relations between them.
///
/// The `DependsOn` relations are kept acyclic at insertion time, and the
/// execution batches are recomputed after every structural change.
/// A task that other tasks are subtasks of is a *container*: it is not
/// executed itself and its status rolls up from its children.
///
/// Deserialized plans are revalidated and their batches recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanRepr")]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub main_task_id: Option<String>,
    tasks: HashMap<String, Task>,
    /// Insertion order of `tasks`
    task_order: Vec<String>,
    relations: Vec<Relation>,
    pub created_at: DateTime<Utc>,
    execution_order: Vec<Vec<String>>,
}

/// Wire form of [`Plan`], checked before it becomes one
#[derive(Deserialize)]
struct PlanRepr {
    id: String,
    name: String,
    description: String,
    #[serde(default)]
    main_task_id: Option<String>,
    tasks: HashMap<String, Task>,
    #[serde(default)]
    task_order: Vec<String>,
    #[serde(default)]
    relations: Vec<Relation>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PlanRepr> for Plan {
    type Error = PlanError;

    fn try_from(repr: PlanRepr) -> Result<Self, Self::Error> {
        let mut task_order = Vec::with_capacity(repr.tasks.len());
        let mut seen = HashSet::new();
        for id in repr.task_order {
            if !repr.tasks.contains_key(&id) {
                return Err(PlanError::TaskNotFound(id));
            }
            if seen.insert(id.clone()) {
                task_order.push(id);
            }
        }
        // Tasks missing from the order go last, oldest first
        let mut missing: Vec<&Task> = repr
            .tasks
            .values()
            .filter(|t| !seen.contains(&t.id))
            .collect();
        missing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        task_order.extend(missing.into_iter().map(|t| t.id.clone()));

        if let Some(main) = &repr.main_task_id {
            if !repr.tasks.contains_key(main) {
                return Err(PlanError::TaskNotFound(main.clone()));
            }
        }

        let mut plan = Plan {
            id: repr.id,
            name: repr.name,
            description: repr.description,
            main_task_id: repr.main_task_id,
            tasks: repr.tasks,
            task_order,
            relations: repr.relations,
            created_at: repr.created_at,
            execution_order: Vec::new(),
        };

        for r in &plan.relations {
            for id in [&r.from_task_id, &r.to_task_id] {
                if !plan.tasks.contains_key(id) {
                    return Err(PlanError::TaskNotFound(id.clone()));
                }
            }
            let closes_loop = r.kind == RelationKind::Subtask
                && plan.is_ancestor(&r.from_task_id, &r.to_task_id);
            if closes_loop {
                return Err(PlanError::Cycle(format!(
                    "{} is both subtask and container of {}",
                    r.from_task_id, r.to_task_id
                )));
            }
        }

        plan.execution_order = plan.compute_batches()?;
        Ok(plan)
    }
}

impl Plan {
    /// Create an empty plan
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: format!("plan-{}", Uuid::new_v4().simple()),
            name: name.into(),
            description: description.into(),
            main_task_id: None,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            relations: Vec::new(),
            created_at: Utc::now(),
            execution_order: Vec::new(),
        }
    }

    /// Move a task into the plan, returning its id
    pub fn add_task(&mut self, task: Task) -> String {
        let id = task.id.clone();
        if self.tasks.insert(id.clone(), task).is_none() {
            self.task_order.push(id.clone());
        }
        self.refresh_execution_order();
        id
    }

    /// Add a relation between two tasks of the plan.
    ///
    /// Fails without touching the plan if either task is missing, if a
    /// `DependsOn` edge would close a cycle, or if a `Subtask` edge would
    /// make a task its own ancestor.
    pub fn add_relation(
        &mut self,
        from_task_id: &str,
        to_task_id: &str,
        kind: RelationKind,
        metadata: Option<DataMap>,
    ) -> Result<(), PlanError> {
        for id in [from_task_id, to_task_id] {
            if !self.tasks.contains_key(id) {
                return Err(PlanError::TaskNotFound(id.to_string()));
            }
        }

        match kind {
            RelationKind::DependsOn => {
                if graph::would_create_cycle(&self.direct_dependencies(), from_task_id, to_task_id) {
                    return Err(PlanError::Cycle(format!(
                        "{} depends on {}",
                        from_task_id, to_task_id
                    )));
                }
            }
            RelationKind::Subtask
                if from_task_id == to_task_id || self.is_ancestor(from_task_id, to_task_id) =>
            {
                return Err(PlanError::Cycle(format!(
                    "{} cannot be a subtask of its own subtask {}",
                    from_task_id, to_task_id
                )));
            }
            RelationKind::Subtask | RelationKind::Blocks | RelationKind::RelatedTo => {}
        }

        self.relations.push(Relation {
            from_task_id: from_task_id.to_string(),
            to_task_id: to_task_id.to_string(),
            kind,
            metadata: metadata.unwrap_or_default(),
        });

        // Container expansion can still surface a cycle (a child depending
        // on its own container), so validate before committing.
        let batches = match self.compute_batches() {
            Ok(batches) => batches,
            Err(err) => {
                self.relations.pop();
                return Err(err);
            }
        };
        self.execution_order = batches;

        if kind == RelationKind::Subtask {
            self.link_subtask(from_task_id, to_task_id);
        }

        debug!(
            plan_id = %self.id,
            from = from_task_id,
            to = to_task_id,
            ?kind,
            "Relation added"
        );
        Ok(())
    }

    /// Look up a task of this plan
    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.task_order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Number of tasks, containers included
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the plan has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Relations in insertion order
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Precomputed batches of task ids, in execution order
    pub fn execution_batches(&self) -> &[Vec<String>] {
        &self.execution_order
    }

    /// Whether the task has subtasks in this plan
    pub fn is_container(&self, task_id: &str) -> bool {
        self.relations
            .iter()
            .any(|r| r.kind == RelationKind::Subtask && r.to_task_id == task_id)
    }

    /// Tasks related to `task_id` in either direction
    pub fn related_tasks(&self, task_id: &str, kind: Option<RelationKind>) -> Vec<&Task> {
        self.relations
            .iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .filter_map(|r| {
                if r.from_task_id == task_id {
                    Some(r.to_task_id.as_str())
                } else if r.to_task_id == task_id {
                    Some(r.from_task_id.as_str())
                } else {
                    None
                }
            })
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Tasks that `task_id` depends on
    pub fn dependencies(&self, task_id: &str) -> Vec<&Task> {
        self.relations
            .iter()
            .filter(|r| r.kind == RelationKind::DependsOn && r.from_task_id == task_id)
            .filter_map(|r| self.tasks.get(&r.to_task_id))
            .collect()
    }

    /// Tasks that depend on `task_id`
    pub fn dependents(&self, task_id: &str) -> Vec<&Task> {
        self.relations
            .iter()
            .filter(|r| r.kind == RelationKind::DependsOn && r.to_task_id == task_id)
            .filter_map(|r| self.tasks.get(&r.from_task_id))
            .collect()
    }

    /// Pending tasks whose dependencies have all completed, highest
    /// priority first. Ties keep creation order.
    pub fn next_ready_tasks(&self) -> Vec<&Task> {
        let deps = self.expanded_dependencies();
        let mut ready: Vec<&Task> = self
            .tasks()
            .filter(|t| t.status == TaskStatus::Pending && !self.is_container(&t.id))
            .filter(|t| {
                deps.get(&t.id).map_or(true, |d| {
                    d.iter().all(|dep| {
                        self.tasks
                            .get(dep)
                            .map_or(true, |dep| dep.status == TaskStatus::Completed)
                    })
                })
            })
            .collect();

        ready.sort_by_key(|t| (Reverse(t.priority), t.created_at));
        ready
    }

    /// Replace a task with an updated copy, then roll the new state up
    /// through its containers
    pub fn update_task(&mut self, task: Task) -> Result<(), PlanError> {
        if !self.tasks.contains_key(&task.id) {
            return Err(PlanError::TaskNotFound(task.id));
        }

        let mut parent = task.parent_id.clone();
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        self.sync_embedded_copy(&id);

        let mut visited = HashSet::from([id]);
        while let Some(container_id) = parent.take() {
            if !self.tasks.contains_key(&container_id) || !visited.insert(container_id.clone()) {
                break;
            }
            self.roll_up(&container_id);
            self.sync_embedded_copy(&container_id);
            parent = self.tasks[&container_id].parent_id.clone();
        }

        Ok(())
    }

    /// Count tasks per status and summarise the plan's progress
    pub fn completion_status(&self) -> CompletionStatus {
        let count = |status: TaskStatus| self.tasks.values().filter(|t| t.status == status).count();

        let total = self.tasks.len();
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);
        let cancelled = count(TaskStatus::Cancelled);

        let completion_percentage = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        CompletionStatus {
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            cancelled_tasks: cancelled,
            pending_tasks: count(TaskStatus::Pending),
            running_tasks: count(TaskStatus::Running),
            approval_required_tasks: count(TaskStatus::ApprovalRequired),
            completion_percentage,
            is_complete: completed + failed + cancelled == total,
            is_successful: failed == 0 && cancelled == 0 && completed == total,
        }
    }

    /// Raw `DependsOn` edges
    fn direct_dependencies(&self) -> DependencyMap {
        let mut deps = DependencyMap::new();
        for r in self.relations.iter().filter(|r| r.kind == RelationKind::DependsOn) {
            deps.entry(r.from_task_id.clone())
                .or_default()
                .push(r.to_task_id.clone());
        }
        deps
    }

    /// Whether `ancestor` is `task_id` or sits above it along `Subtask`
    /// edges or `parent_id` links
    fn is_ancestor(&self, ancestor: &str, task_id: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack = vec![task_id];
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.extend(
                self.relations
                    .iter()
                    .filter(|r| r.kind == RelationKind::Subtask && r.from_task_id == current)
                    .map(|r| r.to_task_id.as_str()),
            );
            if let Some(parent) = self.tasks.get(current).and_then(|t| t.parent_id.as_deref()) {
                stack.push(parent);
            }
        }
        false
    }

    /// `DependsOn` edges of every executable task.
    ///
    /// A task inherits the dependencies of all of its containers, and a
    /// container target stands for the executable tasks underneath it.
    fn expanded_dependencies(&self) -> DependencyMap {
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
        for r in self.relations.iter().filter(|r| r.kind == RelationKind::Subtask) {
            children
                .entry(r.to_task_id.as_str())
                .or_default()
                .push(r.from_task_id.as_str());
            parents
                .entry(r.from_task_id.as_str())
                .or_default()
                .push(r.to_task_id.as_str());
        }
        let direct = self.direct_dependencies();

        let mut deps = DependencyMap::new();
        for id in self.task_order.iter().filter(|id| !children.contains_key(id.as_str())) {
            let mut targets: Vec<&str> = Vec::new();
            let mut seen_up = HashSet::new();
            let mut up = vec![id.as_str()];
            while let Some(node) = up.pop() {
                if !seen_up.insert(node) {
                    continue;
                }
                if let Some(d) = direct.get(node) {
                    targets.extend(d.iter().map(String::as_str));
                }
                if let Some(p) = parents.get(node) {
                    up.extend(p.iter().copied());
                }
            }

            let mut expanded = Vec::new();
            let mut seen = HashSet::new();
            while let Some(target) = targets.pop() {
                if !seen.insert(target) {
                    continue;
                }
                match children.get(target) {
                    Some(kids) => targets.extend(kids.iter().copied()),
                    None => expanded.push(target.to_string()),
                }
            }
            if !expanded.is_empty() {
                deps.insert(id.clone(), expanded);
            }
        }
        deps
    }

    fn compute_batches(&self) -> Result<Vec<Vec<String>>, PlanError> {
        let nodes: Vec<String> = self
            .task_order
            .iter()
            .filter(|id| !self.is_container(id))
            .cloned()
            .collect();
        graph::execution_batches(&nodes, &self.expanded_dependencies())
    }

    fn refresh_execution_order(&mut self) {
        match self.compute_batches() {
            Ok(batches) => self.execution_order = batches,
            Err(err) => warn!(plan_id = %self.id, error = %err, "Failed to compute execution order"),
        }
    }

    fn link_subtask(&mut self, child_id: &str, parent_id: &str) {
        let Some(child) = self.tasks.get_mut(child_id) else {
            return;
        };
        child.parent_id = Some(parent_id.to_string());
        let snapshot = child.clone();

        if let Some(parent) = self.tasks.get_mut(parent_id) {
            match parent.subtasks.iter_mut().find(|s| s.id == snapshot.id) {
                Some(existing) => *existing = snapshot,
                None => parent.subtasks.push(snapshot),
            }
        }
    }

    /// Refresh the copy of `task_id` embedded in its parent's `subtasks`
    fn sync_embedded_copy(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        let Some(parent_id) = task.parent_id.clone() else {
            return;
        };
        let snapshot = task.clone();
        if let Some(parent) = self.tasks.get_mut(&parent_id) {
            if let Some(existing) = parent.subtasks.iter_mut().find(|s| s.id == snapshot.id) {
                *existing = snapshot;
            }
        }
    }

    /// Derive a container's status from its direct children
    fn roll_up(&mut self, container_id: &str) {
        let children: Vec<TaskStatus> = self
            .relations
            .iter()
            .filter(|r| r.kind == RelationKind::Subtask && r.to_task_id == container_id)
            .filter_map(|r| self.tasks.get(&r.from_task_id).map(|t| t.status))
            .collect();

        let Some(container) = self.tasks.get_mut(container_id) else {
            return;
        };
        if children.is_empty() || container.is_terminal() {
            return;
        }

        let total = children.len();
        let completed = children.iter().filter(|s| **s == TaskStatus::Completed).count();
        let terminal = children.iter().filter(|s| s.is_terminal()).count();

        if completed == total {
            container.set_status(TaskStatus::Completed);
        } else if terminal == total {
            container.error = Some(format!(
                "{} of {} subtasks did not complete",
                total - completed,
                total
            ));
            container.set_status(TaskStatus::Failed);
        } else {
            if container.status == TaskStatus::Pending
                && children.iter().any(|s| *s != TaskStatus::Pending)
            {
                container.set_status(TaskStatus::Running);
            }
            container.report_progress(completed as f64 / total as f64);
        }
    }
}
