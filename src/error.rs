//! Error taxonomy shared by the planner, execution engine and orchestrator.

use thiserror::Error;

/// Errors raised by structural operations on a plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("task {0} is not part of the plan")]
    TaskNotFound(String),

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("dependency cycle detected: {0}")]
    Cycle(String),
}

/// Errors surfaced by the orchestration core.
///
/// Structural variants are returned to the caller of the mutating
/// operation. `Timeout`, `PolicyViolation` and `ExecutionFault` are never
/// returned from `submit`; they are rendered into the task's `error`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent with id {0} not found")]
    AgentNotFound(String),

    #[error("agent with id {0} already registered")]
    AlreadyRegistered(String),

    #[error("no suitable agent found for task {0}")]
    NoSuitableAgent(String),

    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    #[error("execution timed out after {0}s")]
    Timeout(f64),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("execution error: {0}")]
    ExecutionFault(String),

    #[error("submission queue is closed")]
    QueueClosed,
}

impl OrchestratorError {
    /// Error category string used in events and logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::NoSuitableAgent(_) => "no_suitable_agent",
            Self::Cycle(_) => "cycle",
            Self::Timeout(_) => "timeout",
            Self::PolicyViolation(_) => "policy_violation",
            Self::ExecutionFault(_) => "execution_fault",
            Self::QueueClosed => "queue_closed",
        }
    }

    /// Runtime failures are recorded on the task instead of being returned
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::PolicyViolation(_) | Self::ExecutionFault(_)
        )
    }
}

impl From<PlanError> for OrchestratorError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::TaskNotFound(id) | PlanError::PlanNotFound(id) => Self::NotFound(id),
            PlanError::Cycle(msg) => Self::Cycle(msg),
        }
    }
}
