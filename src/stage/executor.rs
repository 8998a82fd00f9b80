//! Drives one task attempt through the stage pipeline.
//!
//! Each stage gets a timeout and a bounded retry loop with exponential
//! backoff. Any stage exhausting its retries aborts the run; cleanup runs
//! regardless of how the run ended, and is the one stage cancellation
//! does not interrupt. A panicking stage is contained here and treated as
//! a failed attempt, so a faulty pipeline cannot unwind the worker task.

use crate::error::{Result, StagehandError};
use crate::stage::{PIPELINE, StageContext, StageName, StagePipeline, StageSpec};
use crate::task::{ExecutionResult, StageResult};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Outcome of one full pipeline run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    /// Final outcome per stage reached, pipeline order, cleanup last.
    pub stages: Vec<StageResult>,
}

enum Attempt {
    Succeeded(StageResult),
    Exhausted(StageResult),
    Cancelled(StageResult),
}

/// Resolves only on a genuine cancel. A dropped sender means cancellation
/// can no longer arrive, so the future parks instead of resolving.
async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn stage_timeout(spec: &StageSpec, ctx: &StageContext) -> Duration {
    if spec.name == StageName::Monitor {
        if let Some(ms) = ctx.options.custom_timeout_ms {
            return Duration::from_millis(ms);
        }
    }
    spec.timeout
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

/// Runs the stage pipeline for one task attempt.
pub struct StageExecutor {
    pipeline: Arc<dyn StagePipeline>,
}

impl StageExecutor {
    pub fn new(pipeline: Arc<dyn StagePipeline>) -> Self {
        Self { pipeline }
    }

    /// One pipeline call with panics caught and folded into the stage
    /// error, so the retry loop sees them like any other failure.
    async fn run_contained(&self, name: StageName, ctx: &StageContext) -> Result<String> {
        match AssertUnwindSafe(self.pipeline.run_stage(name, ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                error!(task_id = %ctx.task_id, stage = %name, detail, "stage panicked");
                Err(StagehandError::Stage(format!("{} panicked: {}", name, detail)))
            }
        }
    }

    /// Run every stage in order, stopping at the first exhausted or
    /// cancelled stage, then run cleanup. Never returns an `Err`: every
    /// failure mode is folded into the report.
    pub async fn execute(&self, ctx: &StageContext, mut cancel: watch::Receiver<bool>) -> ExecutionReport {
        let started = Instant::now();
        let mut stages: Vec<StageResult> = Vec::with_capacity(PIPELINE.len());
        let mut failure: Option<(String, String)> = None;
        let mut cancelled = false;

        for spec in PIPELINE.iter().take(PIPELINE.len() - 1) {
            match self.run_stage_with_retry(spec, ctx, Some(&mut cancel)).await {
                Attempt::Succeeded(result) => stages.push(result),
                Attempt::Exhausted(result) => {
                    let detail = result.error.clone().unwrap_or_default();
                    if spec.critical {
                        error!(
                            task_id = %ctx.task_id,
                            stage = %spec.name,
                            error = %detail,
                            "critical stage exhausted its retries, aborting"
                        );
                    } else {
                        warn!(
                            task_id = %ctx.task_id,
                            stage = %spec.name,
                            error = %detail,
                            "stage exhausted its retries, aborting"
                        );
                    }
                    failure = Some((format!("stage {} failed: {}", spec.name, detail), detail));
                    stages.push(result);
                    break;
                }
                Attempt::Cancelled(result) => {
                    debug!(task_id = %ctx.task_id, stage = %spec.name, "run cancelled");
                    stages.push(result);
                    cancelled = true;
                    break;
                }
            }
        }

        let cleanup = &PIPELINE[PIPELINE.len() - 1];
        if ctx.options.skip_cleanup {
            stages.push(StageResult::ok(cleanup.name.as_str(), "skipped (skip-cleanup set)", 0));
        } else {
            // No cancel receiver here: cleanup finishes even on a cancelled run
            match self.run_stage_with_retry(cleanup, ctx, None).await {
                Attempt::Succeeded(result) | Attempt::Exhausted(result) | Attempt::Cancelled(result) => {
                    if !result.success {
                        warn!(
                            task_id = %ctx.task_id,
                            error = %result.error.clone().unwrap_or_default(),
                            "cleanup failed, workspace may be left behind"
                        );
                    }
                    stages.push(result);
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = if cancelled {
            ExecutionResult::cancelled(&ctx.task_id, duration_ms)
        } else if let Some((message, detail)) = failure {
            ExecutionResult::failed(&ctx.task_id, &message, duration_ms, Some(detail))
        } else {
            let artifact_url = if ctx.options.dry_run {
                None
            } else {
                stages
                    .iter()
                    .find(|s| s.success && s.stage == StageName::Publish.as_str())
                    .map(|s| s.output.clone())
                    .filter(|url| !url.is_empty())
            };
            ExecutionResult::completed(&ctx.task_id, "all stages completed", duration_ms, artifact_url)
        };

        ExecutionReport { result, stages }
    }

    async fn run_stage_with_retry(
        &self,
        spec: &StageSpec,
        ctx: &StageContext,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Attempt {
        let timeout = stage_timeout(spec, ctx);
        let attempts = spec.max_retries + 1;
        let stage = spec.name.as_str();
        let mut last_error = String::new();
        let mut last_elapsed = 0u64;

        for attempt in 0..attempts {
            if let Some(rx) = cancel.as_deref_mut() {
                if *rx.borrow_and_update() {
                    return Attempt::Cancelled(StageResult::err(stage, "cancelled before start", 0));
                }
            }

            let started = Instant::now();
            let outcome: Option<std::result::Result<Result<String>, tokio::time::error::Elapsed>> =
                match cancel.as_deref_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = cancel_requested(rx) => None,
                            outcome = tokio::time::timeout(timeout, self.run_contained(spec.name, ctx)) => {
                                Some(outcome)
                            }
                        }
                    }
                    None => Some(tokio::time::timeout(timeout, self.run_contained(spec.name, ctx)).await),
                };
            last_elapsed = started.elapsed().as_millis() as u64;

            match outcome {
                None => {
                    return Attempt::Cancelled(StageResult::err(stage, "cancelled", last_elapsed));
                }
                Some(Ok(Ok(output))) => {
                    debug!(task_id = %ctx.task_id, stage, attempt = attempt + 1, "stage succeeded");
                    return Attempt::Succeeded(StageResult::ok(stage, &output, last_elapsed));
                }
                Some(Ok(Err(e))) => {
                    last_error = e.to_string();
                }
                Some(Err(_)) => {
                    last_error = format!("timed out after {}ms", timeout.as_millis());
                }
            }

            if attempt + 1 < attempts {
                let backoff = Duration::from_secs(1u64 << attempt);
                warn!(
                    task_id = %ctx.task_id,
                    stage,
                    attempt = attempt + 1,
                    attempts,
                    error = %last_error,
                    backoff_secs = backoff.as_secs(),
                    "stage attempt failed, retrying"
                );
                if let Some(rx) = cancel.as_deref_mut() {
                    tokio::select! {
                        _ = cancel_requested(rx) => {
                            return Attempt::Cancelled(StageResult::err(stage, "cancelled", last_elapsed));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                } else {
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Attempt::Exhausted(StageResult::err(stage, &last_error, last_elapsed))
    }
}
