use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::plan::{Plan, RelationKind};
use crate::error::PlanError;
use crate::task::{DataMap, Task, TaskPriority};

/// Declarative description of one step produced by [`TaskPlanner::decompose_task`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Agent to bind; `None` lets the orchestrator route the task
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Indices of other specs this one depends on
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub input_data: DataMap,
}

impl SubtaskSpec {
    /// Subtask with no dependencies
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Depend on other subtasks by their index in the list
    pub fn depends_on(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(indices);
        self
    }

    /// Bind the subtask to an agent instead of routing it
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    fn into_task(self) -> Task {
        let mut task = Task::new(self.name, self.description).with_priority(self.priority);
        task.agent_id = self.agent_id.unwrap_or_default();
        task.requires_approval = self.requires_approval;
        task.input_data = self.input_data;
        task
    }
}

/// Registry of plans built for multi-step work
#[derive(Debug, Default)]
pub struct TaskPlanner {
    plans: HashMap<String, Plan>,
}

impl TaskPlanner {
    /// Create an empty planner
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an empty plan
    pub fn create_plan(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> &mut Plan {
        let plan = Plan::new(name, description);
        let id = plan.id.clone();
        self.plans.entry(id).or_insert(plan)
    }

    /// Look up a registered plan
    pub fn get_plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    /// Look up a registered plan for modification
    pub fn get_plan_mut(&mut self, plan_id: &str) -> Option<&mut Plan> {
        self.plans.get_mut(plan_id)
    }

    /// All plans, oldest first
    pub fn list_plans(&self) -> Vec<&Plan> {
        let mut plans: Vec<&Plan> = self.plans.values().collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Remove a plan. Returns false if it was not registered.
    pub fn delete_plan(&mut self, plan_id: &str) -> bool {
        self.plans.remove(plan_id).is_some()
    }

    /// Register a plan built elsewhere (e.g. restored from a snapshot)
    pub fn insert_plan(&mut self, plan: Plan) -> &mut Plan {
        match self.plans.entry(plan.id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(plan);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(plan),
        }
    }

    /// Break `task` into subtasks described by `specs`.
    ///
    /// Each spec becomes a subtask of `task`; `depends_on` indices become
    /// `DependsOn` relations. Out-of-range indices are skipped. The plan is
    /// only registered if every relation could be added.
    pub fn decompose_task(
        &mut self,
        task: Task,
        specs: Vec<SubtaskSpec>,
    ) -> Result<&mut Plan, PlanError> {
        let mut plan = Plan::new(
            format!("Plan for {}", task.name),
            format!("Execution plan for task: {}", task.description),
        );
        plan.main_task_id = Some(task.id.clone());
        let main_id = plan.add_task(task);

        let dependencies: Vec<Vec<usize>> = specs.iter().map(|s| s.depends_on.clone()).collect();
        let mut subtask_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = plan.add_task(spec.into_task());
            plan.add_relation(&id, &main_id, RelationKind::Subtask, None)?;
            subtask_ids.push(id);
        }

        for (index, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                let Some(dep_id) = subtask_ids.get(dep) else {
                    warn!(index, dep, "Ignoring out-of-range subtask dependency");
                    continue;
                };
                plan.add_relation(&subtask_ids[index], dep_id, RelationKind::DependsOn, None)?;
            }
        }

        info!(
            plan_id = %plan.id,
            subtasks = subtask_ids.len(),
            batches = plan.execution_batches().len(),
            "Task decomposed"
        );
        Ok(self.insert_plan(plan))
    }

    /// Batches of a plan resolved to tasks
    pub fn execution_plan(&self, plan_id: &str) -> Result<Vec<Vec<&Task>>, PlanError> {
        let plan = self
            .get_plan(plan_id)
            .ok_or_else(|| PlanError::PlanNotFound(plan_id.to_string()))?;

        Ok(plan
            .execution_batches()
            .iter()
            .map(|batch| batch.iter().filter_map(|id| plan.get_task(id)).collect())
            .collect())
    }

    /// Write back a task's latest state into its plan
    pub fn update_plan_from_task(&mut self, plan_id: &str, task: Task) -> bool {
        match self.plans.get_mut(plan_id) {
            Some(plan) => plan.update_task(task).is_ok(),
            None => false,
        }
    }
}
