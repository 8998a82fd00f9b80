//! Task records for the scheduling engine.
//!
//! A `Task` is one unit of scheduled work derived from an external issue:
//! the issue payload plus execution options, priority, dependency sets, and
//! mutable lifecycle state. Results are recorded as immutable
//! `ExecutionResult` (per attempt) and `StageResult` (per stage attempt)
//! values.

use crate::id::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A schedulable task backed by an external issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Caller-supplied id, unique for the lifetime of the scheduler
    pub id: String,

    /// Issue title (opaque payload, passed through to stages)
    pub title: String,

    /// Issue body (opaque payload)
    pub body: String,

    /// Source location of the issue's repository
    pub source_url: String,

    /// Higher is more urgent; see the named bands in `task::priority`
    pub priority: i64,

    /// Current lifecycle state
    pub state: TaskState,

    /// Ids this task waits for (maintained mutually with `blocks`)
    pub depends_on: BTreeSet<String>,

    /// Ids waiting for this task
    pub blocks: BTreeSet<String>,

    /// Unix timestamp in milliseconds
    pub created_at: i64,

    /// Set when the task first enters Queued
    pub queued_at: Option<i64>,

    /// Set when the task enters Running
    pub started_at: Option<i64>,

    /// Set when the task reaches a terminal state
    pub completed_at: Option<i64>,

    /// Failed attempts so far
    pub retry_count: u32,

    /// Attempts allowed beyond the first
    pub max_retries: u32,

    /// Base delay for exponential retry backoff
    pub retry_delay_base_ms: u64,

    /// When a RetryScheduled task becomes due
    pub next_retry_at: Option<i64>,

    /// Exclusive workspace for the current attempt
    pub workspace_path: Option<PathBuf>,

    /// Per-task execution options
    pub options: TaskOptions,

    /// Result of the most recent attempt
    pub result: Option<ExecutionResult>,

    /// One message per failed attempt, oldest first
    pub error_history: Vec<String>,

    /// Append-only stage results across all attempts
    pub stage_trail: Vec<StageResult>,

    /// Unix timestamp in milliseconds of the last mutation
    pub updated_at: i64,
}

impl Task {
    /// Build a task from a submission request, applying scheduler defaults
    /// where the request leaves retry settings unset.
    pub fn from_request(request: TaskRequest, default_max_retries: u32, default_retry_delay_ms: u64) -> Self {
        let now = now_ms();
        Self {
            id: request.id,
            title: request.title,
            body: request.body,
            source_url: request.source_url,
            priority: request.priority,
            state: TaskState::Pending,
            depends_on: request.depends_on.into_iter().collect(),
            blocks: BTreeSet::new(),
            created_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            retry_delay_base_ms: request.retry_delay_base_ms.unwrap_or(default_retry_delay_ms),
            next_retry_at: None,
            workspace_path: None,
            options: request.options,
            result: None,
            error_history: Vec::new(),
            stage_trail: Vec::new(),
            updated_at: now,
        }
    }

    /// Update the timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Age of the task in milliseconds.
    pub fn age_ms(&self, now: i64) -> i64 {
        (now - self.created_at).max(0)
    }
}

/// Task lifecycle state machine.
///
/// Transitions are monotonic except for the retry cycle
/// Pending -> Queued -> Running -> RetryScheduled -> Pending.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Recorded, dependencies not yet satisfied
    Pending,
    /// Ready for admission
    Queued,
    /// A worker is executing the stage pipeline
    Running,
    /// All stages succeeded
    Completed,
    /// Exhausted retries or dependency failure
    Failed,
    /// Cancelled by external request
    Cancelled,
    /// Awaiting a backoff deadline before re-queueing
    RetryScheduled,
}

impl TaskState {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::RetryScheduled => "retry_scheduled",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// Check if the task is eligible for admission selection.
    pub fn can_start(&self) -> bool {
        matches!(self, TaskState::Queued)
    }

    /// Check if the priority may still be changed.
    pub fn can_reprioritize(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Queued)
    }

    /// Check whether `self -> to` is a legal lifecycle edge.
    pub fn can_transition(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (*self, to),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Queued, Running)
                | (Queued, Pending)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, RetryScheduled)
                | (RetryScheduled, Pending)
                | (RetryScheduled, Cancelled)
                | (RetryScheduled, Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-task execution options supplied at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TaskOptions {
    /// Permit replacing a terminal record with the same id
    pub force: bool,

    /// Keep the workspace after the run for post-mortem
    pub skip_cleanup: bool,

    /// Override for the monitor stage timeout
    pub custom_timeout_ms: Option<u64>,

    /// Run the pipeline without side-effecting stages
    pub dry_run: bool,
}

/// A submission request as accepted by `Scheduler::submit` and the task file
/// loaded by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TaskRequest {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub source_url: String,

    #[serde(default)]
    pub priority: i64,

    /// Ids this task must wait for
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Override the scheduler's default retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Override the scheduler's default backoff base
    #[serde(default)]
    pub retry_delay_base_ms: Option<u64>,

    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskRequest {
    /// Minimal request with everything else defaulted.
    pub fn new(id: &str, title: &str, priority: i64) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            body: String::new(),
            source_url: String::new(),
            priority,
            depends_on: Vec::new(),
            max_retries: None,
            retry_delay_base_ms: None,
            options: TaskOptions::default(),
        }
    }
}

/// Immutable summary of one terminal task attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub task_id: String,

    /// Terminal state of the attempt: Completed, Failed or Cancelled
    pub state: TaskState,

    pub success: bool,

    /// Human-readable outcome summary
    pub message: String,

    pub duration_ms: u64,

    /// Artifact produced by the publish stage, e.g. a PR URL
    pub artifact_url: Option<String>,

    /// Structured detail for the failing stage, when any
    pub error_detail: Option<String>,
}

impl ExecutionResult {
    /// Result for a fully successful pipeline.
    pub fn completed(task_id: &str, message: &str, duration_ms: u64, artifact_url: Option<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: TaskState::Completed,
            success: true,
            message: message.to_string(),
            duration_ms,
            artifact_url,
            error_detail: None,
        }
    }

    /// Result for an aborted pipeline.
    pub fn failed(task_id: &str, message: &str, duration_ms: u64, error_detail: Option<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: TaskState::Failed,
            success: false,
            message: message.to_string(),
            duration_ms,
            artifact_url: None,
            error_detail,
        }
    }

    /// Result for an externally cancelled run.
    pub fn cancelled(task_id: &str, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: TaskState::Cancelled,
            success: false,
            message: "cancelled".to_string(),
            duration_ms,
            artifact_url: None,
            error_detail: None,
        }
    }
}

/// One stage attempt's outcome, appended to the task's trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Stage name, e.g. "source_clone"
    pub stage: String,

    pub success: bool,

    pub duration_ms: u64,

    /// Captured stage output on success
    pub output: String,

    /// Error text on failure
    pub error: Option<String>,

    /// Unix timestamp in milliseconds when the attempt finished
    pub timestamp: i64,
}

impl StageResult {
    /// Successful stage attempt.
    pub fn ok(stage: &str, output: &str, duration_ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            success: true,
            duration_ms,
            output: output.to_string(),
            error: None,
            timestamp: now_ms(),
        }
    }

    /// Failed stage attempt.
    pub fn err(stage: &str, error: &str, duration_ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            success: false,
            duration_ms,
            output: String::new(),
            error: Some(error.to_string()),
            timestamp: now_ms(),
        }
    }
}
