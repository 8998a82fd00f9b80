//! Task data model: records, lifecycle states, priority bands.

mod priority;
mod record;

pub use priority::{
    PRIORITY_CRITICAL, PRIORITY_DEFERRED, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM, priority_name,
};
pub use record::{ExecutionResult, StageResult, Task, TaskOptions, TaskRequest, TaskState};
