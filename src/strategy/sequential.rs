//! Sequential strategy: one task at a time, strict FIFO.

use crate::resource::ResourceRequirements;
use crate::strategy::{ExecutionStrategy, dependencies_met};
use crate::task::Task;
use std::collections::HashSet;

/// Admits the single oldest runnable task. Priority is never consulted.
#[derive(Debug, Default)]
pub struct SequentialStrategy;

impl SequentialStrategy {
    pub fn new() -> Self {
        Self
    }

    fn fifo(tasks: &[Task]) -> Vec<Task> {
        let mut ordered = tasks.to_vec();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ordered
    }
}

impl ExecutionStrategy for SequentialStrategy {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn max_concurrent(&self) -> usize {
        1
    }

    fn select_next(
        &self,
        queued: &[Task],
        _running: &[Task],
        capacity: usize,
        completed: &HashSet<String>,
    ) -> Vec<String> {
        if capacity == 0 {
            return vec![];
        }
        Self::fifo(queued)
            .into_iter()
            .filter(|t| t.state.can_start() && dependencies_met(t, completed))
            .take(1)
            .map(|t| t.id)
            .collect()
    }

    fn order(&self, tasks: &[Task]) -> Vec<Task> {
        Self::fifo(tasks)
    }

    fn resource_requirements(&self, _task: &Task) -> ResourceRequirements {
        ResourceRequirements::default()
    }

    fn workspace_label(&self, task: &Task) -> String {
        format!("task-{}", task.id)
    }

    fn branch_name(&self, task: &Task) -> String {
        format!("feature/task-{}", task.id)
    }
}
