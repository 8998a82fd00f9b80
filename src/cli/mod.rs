//! CLI module for stagehand - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running task files
//! and previewing admission order.

pub mod commands;

pub use commands::{Cli, Commands};
