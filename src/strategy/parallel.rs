//! Parallel strategy: bounded concurrency, priority-ordered admission.
//!
//! Higher priority wins, ties break FIFO by creation time. There is no
//! anti-starvation: a low-priority task can wait indefinitely behind a
//! continuous stream of higher-priority arrivals.

use crate::id::{now_ms, unique_suffix};
use crate::resource::ResourceRequirements;
use crate::strategy::{ExecutionStrategy, dependencies_met};
use crate::task::Task;
use std::collections::HashSet;

/// Priority-descending admission with a fixed concurrency ceiling.
#[derive(Debug)]
pub struct ParallelStrategy {
    max_concurrent: usize,
}

impl ParallelStrategy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent }
    }

    fn ranked(tasks: &[Task]) -> Vec<Task> {
        let mut ordered = tasks.to_vec();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }
}

impl ExecutionStrategy for ParallelStrategy {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn select_next(
        &self,
        queued: &[Task],
        _running: &[Task],
        capacity: usize,
        completed: &HashSet<String>,
    ) -> Vec<String> {
        Self::ranked(queued)
            .into_iter()
            .filter(|t| t.state.can_start() && dependencies_met(t, completed))
            .take(capacity)
            .map(|t| t.id)
            .collect()
    }

    fn order(&self, tasks: &[Task]) -> Vec<Task> {
        Self::ranked(tasks)
    }

    fn resource_requirements(&self, _task: &Task) -> ResourceRequirements {
        ResourceRequirements::default()
    }

    fn workspace_label(&self, task: &Task) -> String {
        format!("task-{}-{}", task.id, unique_suffix(&task.id))
    }

    fn branch_name(&self, task: &Task) -> String {
        format!("feature/task-{}-{}", task.id, now_ms())
    }
}
