//! Error types for Stagehand
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Stagehand
#[derive(Debug, Error)]
pub enum StagehandError {
    /// Task not found in the task table
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A non-terminal task with this id already exists
    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    /// State transition not allowed by the lifecycle graph
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Adding the dependency would make the graph cyclic
    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    /// Workspace allocation or removal error
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Stage execution error
    #[error("Stage error: {0}")]
    Stage(String),

    /// Resource reservation error
    #[error("Resource error: {0}")]
    Resource(String),

    /// Journal persistence error
    #[error("Journal error: {0}")]
    Journal(String),

    /// Scheduler internal fault (poisoned lock, closed channel)
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;
