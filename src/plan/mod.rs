mod graph;
#[allow(clippy::module_inception)]
mod plan;
mod planner;

pub use graph::{execution_batches, topological_order, would_create_cycle, DependencyMap};
pub use plan::{CompletionStatus, Plan, Relation, RelationKind};
pub use planner::{SubtaskSpec, TaskPlanner};
