//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: submit a task file and execute it to completion
//! - order: preview the admission ranking without executing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stagehand - a staged task execution scheduler
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a task file and run it until every task is terminal
    Run {
        /// YAML task file to submit
        #[arg(short, long)]
        tasks: PathBuf,

        /// Admission strategy (sequential, parallel, priority)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Concurrency ceiling
        #[arg(short, long)]
        max_concurrent: Option<usize>,

        /// Allocate workspaces but skip clone, agent, and publish stages
        #[arg(long)]
        dry_run: bool,

        /// Root directory for task workspaces
        #[arg(short, long)]
        workspace_root: Option<PathBuf>,
    },

    /// Print the admission ranking for a task file without executing
    Order {
        /// YAML task file to rank
        #[arg(short, long)]
        tasks: PathBuf,

        /// Admission strategy (sequential, parallel, priority)
        #[arg(short, long)]
        strategy: Option<String>,
    },
}
