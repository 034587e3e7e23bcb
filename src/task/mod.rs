mod context;
mod result;
mod store;
#[allow(clippy::module_inception)]
mod task;

pub use context::{HistoryEntry, TaskContext};
pub use result::TaskResult;
pub use store::SnapshotStore;
pub use task::{DataMap, Task, TaskPriority, TaskStatus, MAX_IN_FLIGHT_PROGRESS};
