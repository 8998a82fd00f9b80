//! Stage implementations behind the [`StagePipeline`] seam.
//!
//! [`CommandPipeline`] is the real thing: subprocesses for source control
//! and the configured toolchain/agent/publish commands, plus the marker
//! polling loop for the monitor stage. [`MockPipeline`] is a scripted
//! double for executor and scheduler tests.

use crate::config::StageConfig;
use crate::error::{Result, StagehandError};
use crate::stage::{StageContext, StageName};
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::debug;

/// Runs one stage attempt for a task.
///
/// An `Err` is a caught stage failure; the executor decides whether to
/// retry it. Implementations must be cancel-safe: the executor drops the
/// future on timeout or cancellation.
#[async_trait]
pub trait StagePipeline: Send + Sync {
    async fn run_stage(&self, name: StageName, ctx: &StageContext) -> Result<String>;
}

/// Completion marker written by the agent under the workspace.
#[derive(Debug, Deserialize)]
struct Marker {
    status: String,
    #[serde(default)]
    detail: Option<String>,
}

/// Subprocess-backed pipeline.
///
/// Dry-run tasks skip every externally visible stage but still allocate
/// and remove a real workspace, so a dry run exercises the whole pipeline
/// without touching the network or spawning an agent.
pub struct CommandPipeline {
    workspaces: Arc<WorkspaceManager>,
    config: StageConfig,
}

impl CommandPipeline {
    pub fn new(workspaces: Arc<WorkspaceManager>, config: StageConfig) -> Self {
        Self { workspaces, config }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| StagehandError::Stage(format!("failed to spawn git: {}", e)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StagehandError::Stage(format!("git {}: {}", args.join(" "), e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagehandError::Stage(format!(
                "git {} exited with {:?}: {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            )))
        }
    }

    async fn shell(&self, command: &str, cwd: &Path, ctx: &StageContext) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(cwd);
        cmd.env("STAGEHAND_TASK_ID", &ctx.task_id)
            .env("STAGEHAND_BRANCH", &ctx.branch)
            .env("STAGEHAND_WORKSPACE", &ctx.workspace)
            .env("STAGEHAND_SOURCE_URL", &ctx.source_url);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| StagehandError::Stage(format!("failed to spawn '{}': {}", command, e)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StagehandError::Stage(format!("'{}': {}", command, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagehandError::Stage(format!(
                "'{}' exited with {:?}: {}",
                command,
                output.status.code(),
                stderr.trim()
            )))
        }
    }

    async fn workspace_setup(&self, ctx: &StageContext) -> Result<String> {
        let path = self.workspaces.allocate(&ctx.workspace_label)?;
        Ok(format!("workspace ready at {}", path.display()))
    }

    async fn source_clone(&self, ctx: &StageContext) -> Result<String> {
        if self.config.repo_url.is_empty() {
            return Err(StagehandError::Stage("repository URL not configured".to_string()));
        }
        self.git(&ctx.workspace, &["clone", &self.config.repo_url, "repo"]).await?;
        Ok(format!("cloned {} into repo", self.config.repo_url))
    }

    async fn branch_setup(&self, ctx: &StageContext) -> Result<String> {
        self.git(&ctx.repo_dir(), &["checkout", "-b", &ctx.branch]).await?;
        Ok(format!("created branch {}", ctx.branch))
    }

    async fn toolchain_install(&self, ctx: &StageContext) -> Result<String> {
        self.shell(&self.config.toolchain_command, &ctx.repo_dir(), ctx).await?;
        Ok("toolchain installed".to_string())
    }

    async fn agent_spawn(&self, ctx: &StageContext) -> Result<String> {
        let prompt_path = ctx.workspace.join("task-prompt.md");
        let prompt = format!(
            "# Task {}: {}\n\n{}\n\nSource: {}\n",
            ctx.task_id, ctx.title, ctx.body, ctx.source_url
        );
        tokio::fs::write(&prompt_path, prompt)
            .await
            .map_err(|e| StagehandError::Stage(format!("failed to write prompt file: {}", e)))?;

        self.shell(&self.config.agent_command, &ctx.repo_dir(), ctx).await?;
        Ok(format!("agent spawned for task {}", ctx.task_id))
    }

    /// Poll for a completion marker until the agent reports an outcome.
    ///
    /// Loops forever when no marker appears; the executor's stage timeout
    /// bounds it. A marker that fails to parse is ignored, the agent may
    /// still be writing it.
    async fn monitor(&self, ctx: &StageContext) -> Result<String> {
        let pattern = ctx.workspace.join(&self.config.marker_glob);
        let pattern = pattern.to_string_lossy().to_string();
        glob::Pattern::new(&pattern)
            .map_err(|e| StagehandError::Stage(format!("invalid marker glob '{}': {}", self.config.marker_glob, e)))?;

        loop {
            if let Some(path) = latest_marker(&pattern) {
                match read_marker(&path) {
                    Some(marker) if marker.status == "completed" => {
                        return Ok(marker.detail.unwrap_or_else(|| "implementation completed".to_string()));
                    }
                    Some(marker) if marker.status == "failed" => {
                        return Err(StagehandError::Stage(format!(
                            "agent reported failure: {}",
                            marker.detail.unwrap_or_else(|| "no detail".to_string())
                        )));
                    }
                    _ => {
                        debug!(task_id = %ctx.task_id, marker = %path.display(), "marker not conclusive yet");
                    }
                }
            }
            tokio::time::sleep(ctx.monitor_poll_interval).await;
        }
    }

    async fn publish(&self, ctx: &StageContext) -> Result<String> {
        let repo = ctx.repo_dir();

        // Commit whatever the agent left uncommitted before pushing
        let status = self.git(&repo, &["status", "--porcelain"]).await?;
        if !status.is_empty() {
            self.git(&repo, &["add", "-A"]).await?;
            self.git(&repo, &["commit", "-m", &format!("feat: task {}", ctx.task_id)])
                .await?;
        }
        self.git(&repo, &["push", "origin", &ctx.branch]).await?;

        self.shell(&self.config.publish_command, &repo, ctx).await
    }

    async fn cleanup(&self, ctx: &StageContext) -> Result<String> {
        self.workspaces.remove(&ctx.workspace)?;
        Ok("workspace removed".to_string())
    }
}

#[async_trait]
impl StagePipeline for CommandPipeline {
    async fn run_stage(&self, name: StageName, ctx: &StageContext) -> Result<String> {
        if ctx.options.dry_run && !matches!(name, StageName::WorkspaceSetup | StageName::Cleanup) {
            return Ok(format!("skipped {} (dry run)", name));
        }
        match name {
            StageName::WorkspaceSetup => self.workspace_setup(ctx).await,
            StageName::SourceClone => self.source_clone(ctx).await,
            StageName::BranchSetup => self.branch_setup(ctx).await,
            StageName::ToolchainInstall => self.toolchain_install(ctx).await,
            StageName::AgentSpawn => self.agent_spawn(ctx).await,
            StageName::Monitor => self.monitor(ctx).await,
            StageName::Publish => self.publish(ctx).await,
            StageName::Cleanup => self.cleanup(ctx).await,
        }
    }
}

fn latest_marker(pattern: &str) -> Option<PathBuf> {
    let paths = glob::glob(pattern).ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in paths.filter_map(|p| p.ok()) {
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(t, _)| modified >= *t) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, p)| p)
}

fn read_marker(path: &Path) -> Option<Marker> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Scripted pipeline for tests.
///
/// Records every call, tracks the peak number of concurrently running
/// stage attempts, and can fail or delay a chosen stage. Shared across
/// tasks, so failure counts apply to the stage globally, not per task.
pub struct MockPipeline {
    fail_stage: Option<StageName>,
    failures_remaining: AtomicU32,
    delay_stage: Option<StageName>,
    delay: Duration,
    calls: Mutex<Vec<(String, StageName)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockPipeline {
    /// Every stage succeeds immediately.
    pub fn succeeding() -> Self {
        Self {
            fail_stage: None,
            failures_remaining: AtomicU32::new(0),
            delay_stage: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// The given stage fails its first `times` attempts, then succeeds.
    pub fn failing(stage: StageName, times: u32) -> Self {
        let mut mock = Self::succeeding();
        mock.fail_stage = Some(stage);
        mock.failures_remaining = AtomicU32::new(times);
        mock
    }

    /// The given stage fails every attempt.
    pub fn always_failing(stage: StageName) -> Self {
        Self::failing(stage, u32::MAX)
    }

    /// Delay every attempt of the given stage.
    pub fn with_stage_delay(mut self, stage: StageName, delay: Duration) -> Self {
        self.delay_stage = Some(stage);
        self.delay = delay;
        self
    }

    /// All recorded `(task_id, stage)` calls, in order.
    pub fn calls(&self) -> Vec<(String, StageName)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// How many times the given stage was attempted.
    pub fn stage_calls(&self, name: StageName) -> usize {
        self.calls().iter().filter(|(_, stage)| *stage == name).count()
    }

    /// Highest number of stage attempts that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StagePipeline for MockPipeline {
    async fn run_stage(&self, name: StageName, ctx: &StageContext) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((ctx.task_id.clone(), name));
        }

        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if self.delay_stage == Some(name) {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail_stage == Some(name) {
            let should_fail = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                })
                .is_ok();
            if should_fail {
                return Err(StagehandError::Stage(format!("simulated {} failure", name)));
            }
        }

        Ok(format!("{} ok", name))
    }
}
