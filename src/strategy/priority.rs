//! Priority strategy: reserved high-priority capacity plus aging boost.
//!
//! Two refinements over the parallel policy:
//! - Half the slots (rounded up) are reserved for tasks at or above the
//!   high band; lower-priority tasks compete for the rest. Reserved slots
//!   spill to high-priority overflow only while no lower-priority task is
//!   runnable, so waiting low-priority work always keeps a claim on the
//!   general slots.
//! - A task's effective priority rises with queue age, capped at +3 and at
//!   the critical ceiling. The boost affects ordering only; band membership
//!   for slot accounting always uses the raw priority.

use crate::id::{now_ms, unique_suffix};
use crate::resource::ResourceRequirements;
use crate::strategy::{ExecutionStrategy, dependencies_met};
use crate::task::{PRIORITY_CRITICAL, PRIORITY_HIGH, Task, priority_name};
use std::collections::HashSet;
use std::time::Duration;

/// Largest aging boost a waiting task can accumulate.
pub const AGE_BOOST_MAX: i64 = 3;

const DEFAULT_BOOST_THRESHOLD: Duration = Duration::from_secs(300);

/// Reserved-capacity admission with anti-starvation aging.
#[derive(Debug)]
pub struct PriorityStrategy {
    max_concurrent: usize,
    boost_threshold: Duration,
}

impl PriorityStrategy {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            boost_threshold: DEFAULT_BOOST_THRESHOLD,
        }
    }

    /// Set how long a task waits before each +1 boost step.
    pub fn with_boost_threshold(mut self, threshold: Duration) -> Self {
        self.boost_threshold = threshold;
        self
    }

    /// Slots only high-band tasks may occupy.
    pub fn reserved_slots(&self) -> usize {
        self.max_concurrent.div_ceil(2)
    }

    /// Slots open to every band.
    pub fn general_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.reserved_slots())
    }

    fn boosted_priority(&self, task: &Task, now: i64) -> i64 {
        let threshold_ms = self.boost_threshold.as_millis() as i64;
        if threshold_ms <= 0 {
            return task.priority;
        }
        let age = task.age_ms(now);
        if age <= threshold_ms {
            return task.priority;
        }
        let boost = (age / threshold_ms).min(AGE_BOOST_MAX);
        (task.priority + boost).min(PRIORITY_CRITICAL)
    }

    fn ranked(&self, tasks: &[Task], now: i64) -> Vec<Task> {
        let mut scored: Vec<(i64, Task)> = tasks
            .iter()
            .map(|t| (self.boosted_priority(t, now), t.clone()))
            .collect();
        scored.sort_by(|(pa, a), (pb, b)| {
            pb.cmp(pa)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.into_iter().map(|(_, t)| t).collect()
    }
}

impl ExecutionStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn select_next(
        &self,
        queued: &[Task],
        running: &[Task],
        capacity: usize,
        completed: &HashSet<String>,
    ) -> Vec<String> {
        if capacity == 0 {
            return Vec::new();
        }

        let high_running = running.iter().filter(|t| t.priority >= PRIORITY_HIGH).count();
        let low_running = running.len() - high_running;

        // Running overflow high tasks occupy general slots
        let reserved_in_use = high_running.min(self.reserved_slots());
        let general_in_use = low_running + (high_running - reserved_in_use);

        let mut free_reserved = self.reserved_slots().saturating_sub(reserved_in_use);
        let mut free_general = self.general_slots().saturating_sub(general_in_use);

        let runnable: Vec<Task> = self
            .ranked(queued, now_ms())
            .into_iter()
            .filter(|t| t.state.can_start() && dependencies_met(t, completed))
            .collect();
        let mut low_waiting = runnable.iter().filter(|t| t.priority < PRIORITY_HIGH).count();

        let mut selected = Vec::new();
        for task in runnable {
            if selected.len() >= capacity {
                break;
            }
            if task.priority >= PRIORITY_HIGH {
                if free_reserved > 0 {
                    free_reserved -= 1;
                    selected.push(task.id);
                } else if free_general > 0 && low_waiting == 0 {
                    free_general -= 1;
                    selected.push(task.id);
                }
            } else if free_general > 0 {
                free_general -= 1;
                low_waiting -= 1;
                selected.push(task.id);
            }
        }
        selected
    }

    fn order(&self, tasks: &[Task]) -> Vec<Task> {
        self.ranked(tasks, now_ms())
    }

    fn effective_priority(&self, task: &Task) -> i64 {
        self.boosted_priority(task, now_ms())
    }

    fn resource_requirements(&self, task: &Task) -> ResourceRequirements {
        if task.priority >= PRIORITY_CRITICAL {
            ResourceRequirements {
                cpu_cores: 2,
                memory_mb: 1024,
                monitor_interval: Some(Duration::from_millis(500)),
                ..ResourceRequirements::default()
            }
        } else if task.priority >= PRIORITY_HIGH {
            ResourceRequirements {
                memory_mb: 768,
                monitor_interval: Some(Duration::from_secs(1)),
                ..ResourceRequirements::default()
            }
        } else {
            ResourceRequirements {
                monitor_interval: Some(Duration::from_secs(2)),
                ..ResourceRequirements::default()
            }
        }
    }

    fn workspace_label(&self, task: &Task) -> String {
        format!("p{}-task-{}-{}", task.priority, task.id, unique_suffix(&task.id))
    }

    fn branch_name(&self, task: &Task) -> String {
        format!("priority/{}/task-{}-{}", priority_name(task.priority), task.id, now_ms())
    }
}
