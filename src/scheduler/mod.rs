//! Task scheduling: the in-memory table, the orchestration loop, and
//! aggregate statistics.
//!
//! # Architecture
//!
//! The scheduler runs a polling model:
//! 1. Submitted tasks land in the [`TaskTable`] as Pending or Queued
//! 2. Each admission pass asks the strategy which Queued tasks to start
//! 3. Admitted tasks run their stage pipeline on spawned workers
//! 4. Workers apply their own report and wake the loop through a channel
//!
//! [`Scheduler`] is the only entry point callers need; the table and
//! stats types back its status queries.

mod manager;
mod stats;
mod table;

pub use manager::{QueueStatus, Scheduler};
pub use stats::ExecutionStats;
pub use table::TaskTable;
