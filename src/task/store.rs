use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{Task, TaskStatus};
use crate::plan::Plan;

/// JSON snapshots of tasks and plans in a directory.
///
/// Layout: `tasks.json` holds every task, `plans/<id>.json` one plan each.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open a store, creating its directories when needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("plans"))
            .with_context(|| format!("Failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    /// Directory holding the snapshots
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    fn plan_file(&self, plan_id: &str) -> PathBuf {
        self.root.join("plans").join(format!("{}.json", plan_id))
    }

    /// All tasks; empty if nothing was saved yet
    pub fn load(&self) -> Result<Vec<Task>> {
        let path = self.tasks_file();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).context("Failed to read tasks.json")?;
        let tasks: Vec<Task> = serde_json::from_str(&content).context("Failed to parse tasks.json")?;
        Ok(tasks)
    }

    /// Replace `tasks.json` with `tasks`
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        let content = serde_json::to_string_pretty(tasks).context("Failed to serialize tasks")?;
        fs::write(self.tasks_file(), content).context("Failed to write tasks.json")?;
        Ok(())
    }

    /// Insert or replace a task by id
    pub fn upsert(&self, task: &Task) -> Result<()> {
        let mut tasks = self.load()?;
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        self.save(&tasks)
    }

    /// Remove a task by id. Missing ids are ignored.
    pub fn delete(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.load()?;
        tasks.retain(|t| t.id != task_id);
        self.save(&tasks)
    }

    /// Find a task by id
    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let tasks = self.load()?;
        Ok(tasks.into_iter().find(|t| t.id == task_id))
    }

    /// All tasks currently in `status`
    pub fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let tasks = self.load()?;
        Ok(tasks.into_iter().filter(|t| t.status == status).collect())
    }

    /// Write a plan to `plans/<id>.json`, returning the path
    pub fn save_plan(&self, plan: &Plan) -> Result<PathBuf> {
        let path = self.plan_file(&plan.id);
        let content = serde_json::to_string_pretty(plan).context("Failed to serialize plan")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write plan: {}", path.display()))?;
        Ok(path)
    }

    /// Read a plan back. The plan graph is validated while parsing.
    pub fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        let path = self.plan_file(plan_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan: {}", path.display()))
    }

    /// Ids of every saved plan, sorted
    pub fn list_plans(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join("plans")).context("Failed to list plans")? {
            let path = entry.context("Failed to read plans entry")?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
