use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use taskforge::logging::init_subscriber;
use taskforge::plan::CompletionStatus;
use taskforge::task::{DataMap, SnapshotStore};
use taskforge::{
    CommandAgent, Orchestrator, OrchestratorConfig, Plan, SubtaskSpec, Task, TaskPlanner,
    TaskPriority,
};

/// Run dependency-ordered task plans through command agents.
#[derive(Parser, Debug)]
#[command(name = "taskforge", version, about)]
struct Cli {
    /// Directory holding config.json (default: <config dir>/taskforge)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a plan file and print its execution batches
    Validate {
        plan: PathBuf,
    },
    /// Execute a plan file batch by batch
    Run {
        plan: PathBuf,

        /// Approve gated tasks as this user
        #[arg(long)]
        approve_as: Option<String>,

        /// Write task and plan snapshots to this directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Plan file: a main task broken into subtasks
#[derive(Debug, Deserialize)]
struct PlanFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: TaskPriority,
    #[serde(default)]
    input_data: DataMap,
    subtasks: Vec<SubtaskSpec>,
}

impl PlanFile {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))
    }

    fn decompose(self, planner: &mut TaskPlanner) -> Result<&mut Plan> {
        let mut main = Task::new(self.name, self.description).with_priority(self.priority);
        main.input_data = self.input_data;
        planner
            .decompose_task(main, self.subtasks)
            .context("Invalid plan")
    }
}

fn load_config(dir: Option<&Path>) -> Result<OrchestratorConfig> {
    match dir {
        Some(dir) => OrchestratorConfig::load(dir),
        None => match OrchestratorConfig::default_dir() {
            Some(dir) => OrchestratorConfig::load(&dir),
            None => Ok(OrchestratorConfig::default()),
        },
    }
}

fn print_batches(plan: &Plan) {
    println!("{} ({} tasks)", plan.name, plan.len());
    for (index, batch) in plan.execution_batches().iter().enumerate() {
        let names: Vec<&str> = batch
            .iter()
            .filter_map(|id| plan.get_task(id))
            .map(|t| t.name.as_str())
            .collect();
        println!("  batch {}: {}", index + 1, names.join(", "));
    }
}

fn print_status(plan: &Plan, status: &CompletionStatus) {
    for task in plan.tasks() {
        match &task.error {
            Some(error) => println!("  [{}] {}: {}", task.status, task.name, error),
            None => println!("  [{}] {}", task.status, task.name),
        }
    }
    println!(
        "{}/{} completed ({:.0}%), {} failed, {} cancelled, {} awaiting approval",
        status.completed_tasks,
        status.total_tasks,
        status.completion_percentage,
        status.failed_tasks,
        status.cancelled_tasks,
        status.approval_required_tasks
    );
}

async fn run_plan(
    config: OrchestratorConfig,
    plan_path: &Path,
    approve_as: Option<&str>,
    out: Option<&Path>,
) -> Result<()> {
    let mut planner = TaskPlanner::new();
    let plan = PlanFile::load(plan_path)?.decompose(&mut planner)?;

    // Tasks of a batch may queue behind each other on a small pool
    let task_timeout = config.resource_limits.wall_clock_timeout * plan.len().max(1) as u32
        + Duration::from_secs(5);

    let orchestrator = Orchestrator::new(config.clone());
    for (id, spec) in &config.agents {
        orchestrator.register_agent(Arc::new(CommandAgent::new(id, spec.clone())))?;
    }
    orchestrator.start();

    let result = orchestrator.execute_plan(plan, approve_as, task_timeout).await;
    orchestrator.stop().await;
    let status = result?;

    print_status(plan, &status);

    if let Some(out) = out {
        let store = SnapshotStore::new(out)?;
        let tasks: Vec<Task> = plan.tasks().cloned().collect();
        store.save(&tasks)?;
        let path = store.save_plan(plan)?;
        info!(path = %path.display(), "Snapshot written");
    }

    if !status.is_successful {
        bail!("plan {} did not complete successfully", plan.id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Validate { plan } => {
            let mut planner = TaskPlanner::new();
            let plan = PlanFile::load(&plan)?.decompose(&mut planner)?;
            print_batches(plan);
        }
        Command::Run {
            plan,
            approve_as,
            out,
        } => {
            run_plan(config, &plan, approve_as.as_deref(), out.as_deref()).await?;
        }
    }
    Ok(())
}
