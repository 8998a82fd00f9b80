//! Staged execution of a single task.
//!
//! Every admitted task runs the same fixed pipeline: workspace setup, source
//! clone, branch setup, toolchain install, agent spawn, implementation
//! monitoring, result publication, cleanup. Each stage has its own timeout
//! and retry budget; exhausting any stage's budget aborts the task, and
//! cleanup runs regardless of where the pipeline stopped.
//!
//! The [`StageExecutor`] drives the pipeline; the work itself lives behind
//! the [`StagePipeline`] trait so tests can swap in a [`MockPipeline`].

use std::time::Duration;

mod context;
mod executor;
mod pipeline;

pub use context::StageContext;
pub use executor::{ExecutionReport, StageExecutor};
pub use pipeline::{CommandPipeline, MockPipeline, StagePipeline};

/// One step of the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    WorkspaceSetup,
    SourceClone,
    BranchSetup,
    ToolchainInstall,
    AgentSpawn,
    Monitor,
    Publish,
    Cleanup,
}

impl StageName {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::WorkspaceSetup => "workspace_setup",
            StageName::SourceClone => "source_clone",
            StageName::BranchSetup => "branch_setup",
            StageName::ToolchainInstall => "toolchain_install",
            StageName::AgentSpawn => "agent_spawn",
            StageName::Monitor => "monitor",
            StageName::Publish => "publish",
            StageName::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor for one pipeline stage.
///
/// `critical` drives log severity on exhaustion; the abort behavior is the
/// same for every stage.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub name: StageName,
    pub critical: bool,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// The pipeline in execution order. Cleanup is last and always reaches the
/// stage trail.
pub const PIPELINE: [StageSpec; 8] = [
    StageSpec {
        name: StageName::WorkspaceSetup,
        critical: true,
        timeout: Duration::from_secs(30),
        max_retries: 2,
    },
    StageSpec {
        name: StageName::SourceClone,
        critical: true,
        timeout: Duration::from_secs(300),
        max_retries: 3,
    },
    StageSpec {
        name: StageName::BranchSetup,
        critical: false,
        timeout: Duration::from_secs(30),
        max_retries: 2,
    },
    StageSpec {
        name: StageName::ToolchainInstall,
        critical: true,
        timeout: Duration::from_secs(600),
        max_retries: 2,
    },
    StageSpec {
        name: StageName::AgentSpawn,
        critical: false,
        timeout: Duration::from_secs(1800),
        max_retries: 1,
    },
    StageSpec {
        name: StageName::Monitor,
        critical: false,
        timeout: Duration::from_secs(3600),
        max_retries: 1,
    },
    StageSpec {
        name: StageName::Publish,
        critical: false,
        timeout: Duration::from_secs(120),
        max_retries: 2,
    },
    StageSpec {
        name: StageName::Cleanup,
        critical: false,
        timeout: Duration::from_secs(60),
        max_retries: 1,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let names: Vec<&str> = PIPELINE.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "workspace_setup",
                "source_clone",
                "branch_setup",
                "toolchain_install",
                "agent_spawn",
                "monitor",
                "publish",
                "cleanup",
            ]
        );
    }

    #[test]
    fn test_cleanup_is_last() {
        assert_eq!(PIPELINE[PIPELINE.len() - 1].name, StageName::Cleanup);
    }

    #[test]
    fn test_critical_stages() {
        let critical: Vec<StageName> = PIPELINE.iter().filter(|s| s.critical).map(|s| s.name).collect();
        assert_eq!(
            critical,
            vec![
                StageName::WorkspaceSetup,
                StageName::SourceClone,
                StageName::ToolchainInstall,
            ]
        );
    }

    #[test]
    fn test_stage_budgets() {
        let clone = &PIPELINE[1];
        assert_eq!(clone.timeout, Duration::from_secs(300));
        assert_eq!(clone.max_retries, 3);

        let monitor = &PIPELINE[5];
        assert_eq!(monitor.timeout, Duration::from_secs(3600));
        assert_eq!(monitor.max_retries, 1);
    }

    #[test]
    fn test_stage_name_display() {
        assert_eq!(StageName::AgentSpawn.to_string(), "agent_spawn");
        assert_eq!(format!("{}", StageName::Monitor), "monitor");
    }
}
