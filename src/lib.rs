//! Stagehand - a staged task execution scheduler
//!
//! Stagehand turns a backlog of submitted tasks into isolated, automated
//! runs: each admitted task gets a fresh workspace and branch, walks a
//! fixed stage pipeline, and reports back through a journalled lifecycle
//! with priority ordering, dependency gating, bounded concurrency, and
//! retry with exponential backoff.

pub mod cli;
pub mod config;
pub mod error;
pub mod id;
pub mod journal;
pub mod resource;
pub mod scheduler;
pub mod stage;
pub mod strategy;
pub mod task;
pub mod workspace;

pub use error::{Result, StagehandError};
