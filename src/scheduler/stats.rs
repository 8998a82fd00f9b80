//! Aggregate execution statistics.
//!
//! Pure functions over a table snapshot; no locking here.

use crate::task::{Task, TaskState};
use std::collections::BTreeMap;

const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

/// Summary counters for the dashboard and the CLI run summary.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStats {
    pub total_tasks: usize,
    pub by_state: BTreeMap<String, usize>,

    /// Percentage of terminal runs that completed. Cancellations are
    /// excluded from the denominator.
    pub success_rate: f64,

    /// Mean duration over completed results.
    pub average_execution_time_ms: f64,

    /// Completions in the trailing 24 hours, divided by 24.
    pub tasks_per_hour: f64,
}

impl ExecutionStats {
    pub fn compute(tasks: &[Task], now: i64) -> Self {
        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        for task in tasks {
            *by_state.entry(task.state.as_str().to_string()).or_insert(0) += 1;
        }

        let completed = tasks.iter().filter(|t| t.state == TaskState::Completed).count();
        let failed = tasks.iter().filter(|t| t.state == TaskState::Failed).count();
        let success_rate = if completed + failed == 0 {
            0.0
        } else {
            completed as f64 / (completed + failed) as f64 * 100.0
        };

        let durations: Vec<u64> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .filter_map(|t| t.result.as_ref())
            .map(|r| r.duration_ms)
            .collect();
        let average_execution_time_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let completed_recently = tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .filter(|t| t.completed_at.is_some_and(|at| at >= now - DAY_MS))
            .count();
        let tasks_per_hour = completed_recently as f64 / 24.0;

        Self {
            total_tasks: tasks.len(),
            by_state,
            success_rate,
            average_execution_time_ms,
            tasks_per_hour,
        }
    }
}
