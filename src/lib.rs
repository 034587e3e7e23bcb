//! In-process task orchestration core.
//!
//! Tasks are planned into dependency-ordered batches ([`plan`]), executed
//! by pluggable [`agent::Agent`] implementations under a time and policy
//! budget ([`execution`]), and scheduled by the [`Orchestrator`] on a
//! bounded worker pool with approval and cancellation support.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod task;

pub use agent::{Agent, AgentInfo, CommandAgent, CommandSpec};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, PlanError};
pub use orchestrator::{EventKind, Orchestrator, OrchestratorEvent};
pub use plan::{Plan, RelationKind, SubtaskSpec, TaskPlanner};
pub use task::{Task, TaskContext, TaskPriority, TaskResult, TaskStatus};
