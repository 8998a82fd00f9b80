//! Per-attempt execution context handed to every stage.

use crate::task::{Task, TaskOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Everything a stage needs to know about the attempt it is running.
///
/// Built by the scheduler at admission time; immutable for the lifetime of
/// one pipeline run. A retried task gets a fresh context with a fresh
/// workspace path.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: String,
    pub title: String,
    pub body: String,
    pub source_url: String,
    pub priority: i64,
    /// Directory name under the workspace root, chosen by the strategy.
    pub workspace_label: String,
    /// Resolved workspace path for this attempt.
    pub workspace: PathBuf,
    /// Branch created for this attempt, chosen by the strategy.
    pub branch: String,
    pub options: TaskOptions,
    /// Marker-poll cadence for the monitor stage.
    pub monitor_poll_interval: Duration,
}

impl StageContext {
    pub fn new(
        task: &Task,
        workspace_label: String,
        workspace: PathBuf,
        branch: String,
        monitor_poll_interval: Duration,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            body: task.body.clone(),
            source_url: task.source_url.clone(),
            priority: task.priority,
            workspace_label,
            workspace,
            branch,
            options: task.options.clone(),
            monitor_poll_interval,
        }
    }

    /// Directory the source is cloned into.
    pub fn repo_dir(&self) -> PathBuf {
        self.workspace.join("repo")
    }
}
