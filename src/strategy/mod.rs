//! Pluggable admission-ordering strategies.
//!
//! A strategy decides which queued tasks to admit into the worker pool and
//! in what order, given the free capacity and the currently running set:
//! - **Sequential**: one at a time, FIFO by creation time, priority ignored.
//! - **Parallel**: bounded concurrency, priority-ordered, no anti-starvation.
//! - **Priority**: bounded concurrency with capacity reserved for
//!   high-priority work and aging-based anti-starvation boosting.
//!
//! Strategies are pure over snapshots of the task table; the scheduler owns
//! all mutation. They also size per-task resource reservations and name
//! workspaces and branches, since both vary by policy.

use crate::resource::ResourceRequirements;
use crate::task::Task;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

mod parallel;
mod priority;
mod sequential;

pub use parallel::ParallelStrategy;
pub use priority::{AGE_BOOST_MAX, PriorityStrategy};
pub use sequential::SequentialStrategy;

/// Admission-ordering policy.
pub trait ExecutionStrategy: Send + Sync {
    /// Policy name for logs and display.
    fn name(&self) -> &'static str;

    /// Concurrency ceiling the scheduler enforces for this policy.
    fn max_concurrent(&self) -> usize;

    /// Pick up to `capacity` task ids to admit now, in admission order.
    ///
    /// `queued` is the snapshot of Queued tasks, `running` the snapshot of
    /// Running tasks, `completed` the ids of Completed tasks for dependency
    /// gating. Tasks with unmet dependencies are never returned.
    fn select_next(
        &self,
        queued: &[Task],
        running: &[Task],
        capacity: usize,
        completed: &HashSet<String>,
    ) -> Vec<String>;

    /// Full ranking of the given tasks, for display and diagnostics.
    fn order(&self, tasks: &[Task]) -> Vec<Task>;

    /// Priority used for ordering, after policy adjustments.
    fn effective_priority(&self, task: &Task) -> i64 {
        task.priority
    }

    /// Reservation sizing for this task.
    fn resource_requirements(&self, task: &Task) -> ResourceRequirements {
        let _ = task;
        ResourceRequirements::default()
    }

    /// Workspace directory label for the next attempt.
    fn workspace_label(&self, task: &Task) -> String;

    /// Branch name for the next attempt.
    fn branch_name(&self, task: &Task) -> String;
}

/// True when every dependency is in the completed set.
pub fn dependencies_met(task: &Task, completed: &HashSet<String>) -> bool {
    task.depends_on.iter().all(|dep| completed.contains(dep))
}

/// Which strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Sequential,
    Parallel,
    Priority,
}

impl StrategyKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Sequential => "sequential",
            StrategyKind::Parallel => "parallel",
            StrategyKind::Priority => "priority",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(StrategyKind::Sequential),
            "parallel" => Ok(StrategyKind::Parallel),
            "priority" => Ok(StrategyKind::Priority),
            other => Err(format!("unknown strategy kind: {}", other)),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the configured strategy.
pub fn strategy_for(kind: StrategyKind, max_concurrent: usize, boost_threshold: Duration) -> Arc<dyn ExecutionStrategy> {
    match kind {
        StrategyKind::Sequential => Arc::new(SequentialStrategy::new()),
        StrategyKind::Parallel => Arc::new(ParallelStrategy::new(max_concurrent)),
        StrategyKind::Priority => Arc::new(PriorityStrategy::new(max_concurrent).with_boost_threshold(boost_threshold)),
    }
}
