//! Global configuration.
//!
//! Loaded from .stagehand.yml or ~/.config/stagehand/stagehand.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for Stagehand.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Scheduler loop cadence and retry defaults.
    pub scheduler: SchedulerConfig,

    /// Admission strategy selection.
    pub strategy: StrategyConfig,

    /// Stage pipeline settings.
    pub stages: StageConfig,

    /// Resource pool totals.
    pub resources: ResourceConfig,

    /// Event journal settings.
    pub journal: JournalConfig,
}

impl GlobalConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .stagehand.yml in current directory
    /// 3. ~/.config/stagehand/stagehand.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // Explicit path takes precedence
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project config
        let project_config = PathBuf::from(".stagehand.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from .stagehand.yml");
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load .stagehand.yml: {}", e);
                }
            }
        }

        // Try user config
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("stagehand").join("stagehand.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // Use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.strategy.max_concurrent == 0 {
            eyre::bail!("strategy.max-concurrent must be > 0");
        }
        if self.scheduler.poll_interval_ms == 0 {
            eyre::bail!("scheduler.poll-interval-ms must be > 0");
        }
        if self.scheduler.retry_scan_interval_ms == 0 {
            eyre::bail!("scheduler.retry-scan-interval-ms must be > 0");
        }
        if self.resources.slots == 0 {
            eyre::bail!("resources.slots must be > 0");
        }
        if self.strategy.kind.parse::<crate::strategy::StrategyKind>().is_err() {
            eyre::bail!(
                "strategy.kind must be one of: sequential, parallel, priority (got {:?})",
                self.strategy.kind
            );
        }
        Ok(())
    }
}

/// Scheduler loop cadence and retry defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Admission loop wake interval.
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Retry scanner wake interval.
    #[serde(rename = "retry-scan-interval-ms")]
    pub retry_scan_interval_ms: u64,

    /// Default task retry budget.
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Default base for exponential retry backoff.
    #[serde(rename = "retry-delay-base-ms")]
    pub retry_delay_base_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            retry_scan_interval_ms: 30_000,
            max_retries: 2,
            retry_delay_base_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_scan_interval(&self) -> Duration {
        Duration::from_millis(self.retry_scan_interval_ms)
    }
}

/// Admission strategy selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// One of: sequential, parallel, priority.
    pub kind: String,

    /// Concurrency ceiling for parallel and priority.
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    /// Age after which the Priority strategy starts boosting.
    #[serde(rename = "boost-threshold-secs")]
    pub boost_threshold_secs: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: "parallel".to_string(),
            max_concurrent: 2,
            boost_threshold_secs: 300,
        }
    }
}

/// Stage pipeline settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StageConfig {
    /// Root directory for per-attempt workspaces.
    #[serde(rename = "workspace-root")]
    pub workspace_root: PathBuf,

    /// Repository cloned into each workspace. Required unless every task
    /// runs with dry-run set.
    #[serde(rename = "repo-url")]
    pub repo_url: String,

    /// Default marker-poll cadence for the monitor stage.
    #[serde(rename = "monitor-poll-interval-ms")]
    pub monitor_poll_interval_ms: u64,

    /// Glob, relative to the workspace, matched against completion markers.
    #[serde(rename = "marker-glob")]
    pub marker_glob: String,

    /// Command run in the workspace to install the agent toolchain.
    #[serde(rename = "toolchain-command")]
    pub toolchain_command: String,

    /// Command run in the workspace to start the implementation agent.
    #[serde(rename = "agent-command")]
    pub agent_command: String,

    /// Command run in the workspace to publish the result.
    #[serde(rename = "publish-command")]
    pub publish_command: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/stagehand/workspaces"),
            repo_url: String::new(),
            monitor_poll_interval_ms: 30_000,
            marker_glob: ".agent/status-*.json".to_string(),
            toolchain_command: "npm install".to_string(),
            agent_command: "automation-agent".to_string(),
            publish_command: "gh pr create --fill".to_string(),
        }
    }
}

impl StageConfig {
    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }
}

/// Resource pool totals.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Reservation slots.
    pub slots: usize,

    /// Total CPU cores available to grants.
    #[serde(rename = "cpu-cores")]
    pub cpu_cores: u32,

    /// Total memory available to grants.
    #[serde(rename = "memory-mb")]
    pub memory_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            cpu_cores: 8,
            memory_mb: 16_384,
        }
    }
}

/// Event journal settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,

    /// Journal directory.
    pub dir: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        let default_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stagehand");

        Self {
            enabled: true,
            dir: default_dir,
        }
    }
}
