//! Scheduler orchestration: submission, admission, workers, retries.
//!
//! The scheduler owns the task table behind one mutex and a map of worker
//! handles beside it. Admission snapshots candidates under the table lock,
//! drops it, reserves resources, then re-locks to validate and admit, so
//! the table lock and the resource lock are never held together. Workers
//! release their reservation and apply their own report when they finish,
//! which keeps the table consistent even if the scheduler loop is gone.

use crate::config::SchedulerConfig;
use crate::error::{Result, StagehandError};
use crate::id::now_ms;
use crate::journal::{
    EVENT_CANCELLED, EVENT_COMPLETED, EVENT_DEPENDENCY_ADDED, EVENT_FAILED, EVENT_PRIORITY_CHANGED,
    EVENT_QUEUED, EVENT_RETRY_SCHEDULED, EVENT_STAGE, EVENT_STARTED, EVENT_SUBMITTED, TaskJournal,
};
use crate::resource::ResourceManager;
use crate::scheduler::stats::ExecutionStats;
use crate::scheduler::table::TaskTable;
use crate::stage::{ExecutionReport, StageContext, StageExecutor, StagePipeline};
use crate::strategy::ExecutionStrategy;
use crate::task::{ExecutionResult, Task, TaskRequest, TaskState};
use crate::workspace::WorkspaceManager;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKER_EVENT_BUFFER: usize = 64;

/// Point-in-time queue view for dashboards and the CLI.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    /// Tasks ready for admission (Queued)
    pub queue_size: usize,
    /// Tasks awaiting admission (Pending and Queued), `pending_ids.len()`
    pub pending_count: usize,
    pub running_count: usize,
    pub max_concurrent: usize,
    /// Pending and Queued ids, oldest first
    pub pending_ids: Vec<String>,
    pub running_ids: Vec<String>,
}

struct WorkerHandle {
    handle: JoinHandle<()>,
    cancel_tx: watch::Sender<bool>,
    cancel_requested: bool,
}

struct SchedulerState {
    table: TaskTable,
    workers: HashMap<String, WorkerHandle>,
    admissions_paused: bool,
}

struct WorkerEvent {
    task_id: String,
}

/// Task scheduler. All methods take `&self`; share it behind an `Arc`.
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    strategy: Arc<dyn ExecutionStrategy>,
    resources: Arc<dyn ResourceManager>,
    pipeline: Arc<dyn StagePipeline>,
    workspaces: Arc<WorkspaceManager>,
    journal: Option<Arc<TaskJournal>>,
    config: SchedulerConfig,
    default_monitor_interval: Duration,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        strategy: Arc<dyn ExecutionStrategy>,
        resources: Arc<dyn ResourceManager>,
        pipeline: Arc<dyn StagePipeline>,
        workspaces: Arc<WorkspaceManager>,
        config: SchedulerConfig,
        default_monitor_interval: Duration,
        journal: Option<Arc<TaskJournal>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(WORKER_EVENT_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                table: TaskTable::new(),
                workers: HashMap::new(),
                admissions_paused: false,
            })),
            strategy,
            resources,
            pipeline,
            workspaces,
            journal,
            config,
            default_monitor_interval,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SchedulerState>> {
        self.state
            .lock()
            .map_err(|_| StagehandError::Scheduler("task table lock poisoned".to_string()))
    }

    /// Record a task. Returns false when the id is taken by a non-terminal
    /// task, when a terminal record exists without `options.force`, or
    /// when its dependencies would close a cycle.
    pub fn submit(&self, request: TaskRequest) -> Result<bool> {
        let task = Task::from_request(request, self.config.max_retries, self.config.retry_delay_base_ms);
        let task_id = task.id.clone();
        let mut state = self.lock_state()?;

        if let Some(existing) = state.table.get(&task_id) {
            if existing.state.is_terminal() && task.options.force {
                info!(task_id = %task_id, "force resubmission replaces terminal record");
                state.table.remove(&task_id);
            } else {
                debug!(task_id = %task_id, state = %existing.state, "submission rejected, id in use");
                return Ok(false);
            }
        }

        for dep in &task.depends_on {
            if state.table.would_create_cycle(&task_id, dep) {
                warn!(task_id = %task_id, dependency = %dep, "submission rejected, dependency cycle");
                return Ok(false);
            }
        }

        let detail = json!({
            "title": task.title,
            "priority": task.priority,
            "depends-on": task.depends_on.iter().cloned().collect::<Vec<String>>(),
        });
        info!(task_id = %task_id, priority = task.priority, "task submitted");
        state.table.insert(task)?;
        journal_record(self.journal.as_deref(), &task_id, EVENT_SUBMITTED, detail);
        promote_ready(&mut state.table, self.journal.as_deref());
        Ok(true)
    }

    /// Submit requests in order; one accept flag per request.
    pub fn submit_batch(&self, requests: Vec<TaskRequest>) -> Result<Vec<bool>> {
        let mut accepted = Vec::with_capacity(requests.len());
        for request in requests {
            accepted.push(self.submit(request)?);
        }
        Ok(accepted)
    }

    /// Cancel a task. A waiting task is marked Cancelled directly; a
    /// running one has its worker signalled and is marked when the worker
    /// reports back. Returns false for unknown ids, terminal tasks, and
    /// repeated cancels of the same run.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let mut state = self.lock_state()?;
        let Some(task) = state.table.get(task_id) else {
            debug!(task_id = %task_id, "cancel for unknown task");
            return Ok(false);
        };

        match task.state {
            TaskState::Running => {
                let Some(worker) = state.workers.get_mut(task_id) else {
                    warn!(task_id = %task_id, "running task has no worker entry");
                    return Ok(false);
                };
                if worker.cancel_requested {
                    return Ok(false);
                }
                worker.cancel_requested = true;
                let _ = worker.cancel_tx.send(true);
                info!(task_id = %task_id, "cancel signalled to worker");
                Ok(true)
            }
            TaskState::Pending | TaskState::Queued | TaskState::RetryScheduled => {
                state.table.transition(task_id, TaskState::Cancelled)?;
                if let Some(task) = state.table.get_mut(task_id) {
                    task.result = Some(ExecutionResult::cancelled(task_id, 0));
                }
                info!(task_id = %task_id, "task cancelled before start");
                journal_record(self.journal.as_deref(), task_id, EVENT_CANCELLED, json!({"while": "waiting"}));
                fail_dependents(&mut state.table, self.journal.as_deref(), task_id, "was cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Change the priority of a task that has not started.
    pub fn set_priority(&self, task_id: &str, priority: i64) -> Result<bool> {
        let mut state = self.lock_state()?;
        let Some(task) = state.table.get_mut(task_id) else {
            return Ok(false);
        };
        if !task.state.can_reprioritize() {
            debug!(task_id = %task_id, state = %task.state, "priority change rejected");
            return Ok(false);
        }
        let previous = task.priority;
        task.priority = priority;
        task.touch();
        info!(task_id = %task_id, from = previous, to = priority, "priority changed");
        journal_record(
            self.journal.as_deref(),
            task_id,
            EVENT_PRIORITY_CHANGED,
            json!({"from": previous, "to": priority}),
        );
        Ok(true)
    }

    /// Add a dependency edge. Both tasks must exist, the dependent must
    /// not have started, the dependency must not already be Failed or
    /// Cancelled, and the edge must not close a cycle. A queued dependent
    /// gated by the new edge goes back to Pending.
    pub fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<bool> {
        let mut state = self.lock_state()?;

        let Some(task) = state.table.get(task_id) else {
            return Ok(false);
        };
        if !matches!(task.state, TaskState::Pending | TaskState::Queued) {
            debug!(task_id = %task_id, state = %task.state, "dependency rejected, task already started");
            return Ok(false);
        }
        if task.depends_on.contains(depends_on) {
            return Ok(true);
        }
        let Some(dep) = state.table.get(depends_on) else {
            return Ok(false);
        };
        if matches!(dep.state, TaskState::Failed | TaskState::Cancelled) {
            warn!(
                task_id = %task_id,
                dependency = %depends_on,
                "dependency rejected, it already ended in failure"
            );
            return Ok(false);
        }
        if state.table.would_create_cycle(task_id, depends_on) {
            warn!(task_id = %task_id, dependency = %depends_on, "dependency rejected, would create a cycle");
            return Ok(false);
        }

        if let Some(task) = state.table.get_mut(task_id) {
            task.depends_on.insert(depends_on.to_string());
            task.touch();
        }
        if let Some(dep) = state.table.get_mut(depends_on) {
            dep.blocks.insert(task_id.to_string());
        }
        let re_blocked = match state.table.get(task_id) {
            Some(task) => task.state == TaskState::Queued && !state.table.dependencies_met(task),
            None => false,
        };
        if re_blocked {
            match state.table.transition(task_id, TaskState::Pending) {
                Ok(()) => debug!(task_id = %task_id, "queued task re-blocked by new dependency"),
                Err(e) => warn!(task_id = %task_id, error = %e, "re-block transition failed"),
            }
        }
        info!(task_id = %task_id, dependency = %depends_on, "dependency added");
        journal_record(
            self.journal.as_deref(),
            task_id,
            EVENT_DEPENDENCY_ADDED,
            json!({"depends-on": depends_on}),
        );
        Ok(true)
    }

    /// Snapshot clone of one task record.
    pub fn task_status(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.lock_state()?.table.get(task_id).cloned())
    }

    pub fn queue_status(&self) -> Result<QueueStatus> {
        let state = self.lock_state()?;
        let mut waiting: Vec<Task> = state
            .table
            .tasks()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Queued))
            .cloned()
            .collect();
        waiting.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let running = state.table.list_by_state(TaskState::Running);
        let pending_ids: Vec<String> = waiting.into_iter().map(|t| t.id).collect();

        Ok(QueueStatus {
            queue_size: state.table.count_in_state(TaskState::Queued),
            pending_count: pending_ids.len(),
            running_count: running.len(),
            max_concurrent: self.strategy.max_concurrent(),
            pending_ids,
            running_ids: running.into_iter().map(|t| t.id).collect(),
        })
    }

    pub fn execution_stats(&self) -> Result<ExecutionStats> {
        let snapshot = self.lock_state()?.table.snapshot();
        Ok(ExecutionStats::compute(&snapshot, now_ms()))
    }

    /// True when every recorded task is in a terminal state.
    pub fn all_terminal(&self) -> Result<bool> {
        Ok(self.lock_state()?.table.tasks().all(|t| t.state.is_terminal()))
    }

    /// Stop admitting new work; running tasks continue and retries are
    /// still scheduled.
    pub fn pause_admissions(&self) {
        match self.state.lock() {
            Ok(mut state) => {
                state.admissions_paused = true;
                info!("admissions paused");
            }
            Err(_) => error!("task table lock poisoned, pause ignored"),
        }
    }

    pub fn resume_admissions(&self) {
        match self.state.lock() {
            Ok(mut state) => {
                state.admissions_paused = false;
                info!("admissions resumed");
            }
            Err(_) => error!("task table lock poisoned, resume ignored"),
        }
    }

    /// Drive admissions and retries until shutdown. Call once.
    pub async fn run(&self) -> Result<()> {
        let mut events_rx = {
            let Ok(mut slot) = self.events_rx.lock() else {
                return Err(StagehandError::Scheduler("events receiver lock poisoned".to_string()));
            };
            slot.take()
                .ok_or_else(|| StagehandError::Scheduler("scheduler is already running".to_string()))?
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut poll = tokio::time::interval(self.config.poll_interval());
        let mut retry_tick = tokio::time::interval(self.config.retry_scan_interval());
        info!(
            strategy = self.strategy.name(),
            max_concurrent = self.strategy.max_concurrent(),
            "scheduler loop started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = poll.tick() => self.admission_pass(),
                _ = retry_tick.tick() => {
                    self.requeue_due_retries();
                    self.admission_pass();
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.reap(&event.task_id).await;
                            self.admission_pass();
                        }
                        None => break,
                    }
                }
            }
        }
        info!("scheduler loop stopped");
        Ok(())
    }

    /// Stop the loops, optionally cancel all workers, and drain their
    /// handles.
    pub async fn shutdown(&self, cancel_running: bool) {
        info!(cancel_running, "scheduler shutting down");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let Ok(mut state) = self.state.lock() else {
                error!("task table lock poisoned during shutdown");
                return;
            };
            state
                .workers
                .drain()
                .map(|(_, worker)| {
                    if cancel_running {
                        let _ = worker.cancel_tx.send(true);
                    }
                    worker.handle
                })
                .collect()
        };
        if !handles.is_empty() {
            info!(workers = handles.len(), "draining worker handles");
            futures::future::join_all(handles).await;
        }
    }

    /// One admission cycle: promote ready tasks, ask the strategy for
    /// candidates, admit them until capacity or resources run out.
    fn admission_pass(&self) {
        let selected = {
            let Ok(mut state) = self.state.lock() else {
                error!("task table lock poisoned, skipping admission pass");
                return;
            };
            promote_ready(&mut state.table, self.journal.as_deref());
            if state.admissions_paused {
                return;
            }
            let running = state.table.list_by_state(TaskState::Running);
            let capacity = self.strategy.max_concurrent().saturating_sub(running.len());
            if capacity == 0 {
                return;
            }
            let queued = state.table.list_by_state(TaskState::Queued);
            if queued.is_empty() {
                return;
            }
            let completed = state.table.completed_ids();
            self.strategy.select_next(&queued, &running, capacity, &completed)
        };

        for task_id in selected {
            if !self.try_admit(&task_id) {
                break;
            }
        }
    }

    /// Admit one task: reserve resources, transition to Running, spawn the
    /// worker. Returns false when the pass should stop (no resources or a
    /// poisoned lock); a skipped task returns true so later candidates
    /// still get their chance.
    fn try_admit(&self, task_id: &str) -> bool {
        let snapshot = {
            let Ok(state) = self.state.lock() else {
                return false;
            };
            match state.table.get(task_id) {
                Some(task) if task.state.can_start() && state.table.dependencies_met(task) => task.clone(),
                _ => return true,
            }
        };

        let requirements = self.strategy.resource_requirements(&snapshot);
        if !self.resources.acquire(task_id, &requirements) {
            debug!(task_id = %task_id, "resource acquisition failed, deferring admission");
            return false;
        }

        let label = self.strategy.workspace_label(&snapshot);
        let branch = self.strategy.branch_name(&snapshot);
        let workspace = self.workspaces.path_for(&label);
        let monitor_interval = requirements.monitor_interval.unwrap_or(self.default_monitor_interval);

        let Ok(mut state) = self.state.lock() else {
            self.resources.release(task_id);
            return false;
        };
        // The Queued snapshot may be stale: a cancel can land between the
        // reservation and here
        if !state.table.get(task_id).map(|t| t.state.can_start()).unwrap_or(false) {
            drop(state);
            self.resources.release(task_id);
            debug!(task_id = %task_id, "task no longer admissible, reservation released");
            return true;
        }
        if let Err(e) = state.table.transition(task_id, TaskState::Running) {
            drop(state);
            self.resources.release(task_id);
            warn!(task_id = %task_id, error = %e, "admission transition failed");
            return true;
        }

        let ctx = {
            let Some(task) = state.table.get_mut(task_id) else {
                drop(state);
                self.resources.release(task_id);
                return true;
            };
            task.workspace_path = Some(workspace.clone());
            StageContext::new(task, label.clone(), workspace.clone(), branch.clone(), monitor_interval)
        };
        journal_record(
            self.journal.as_deref(),
            task_id,
            EVENT_STARTED,
            json!({"workspace": workspace.display().to_string(), "branch": branch}),
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let executor = StageExecutor::new(Arc::clone(&self.pipeline));
        let worker_state = Arc::clone(&self.state);
        let worker_resources = Arc::clone(&self.resources);
        let worker_journal = self.journal.clone();
        let worker_events = self.events_tx.clone();
        let worker_id = task_id.to_string();

        let handle = tokio::spawn(async move {
            let report = executor.execute(&ctx, cancel_rx).await;
            worker_resources.release(&worker_id);
            apply_report(&worker_state, worker_journal.as_deref(), &worker_id, report);
            // A full buffer only delays the wake-up until the next poll tick
            if let Err(e) = worker_events.try_send(WorkerEvent { task_id: worker_id.clone() }) {
                debug!(task_id = %worker_id, error = %e, "worker event not delivered");
            }
        });
        state.workers.insert(
            task_id.to_string(),
            WorkerHandle {
                handle,
                cancel_tx,
                cancel_requested: false,
            },
        );
        drop(state);

        info!(task_id = %task_id, workspace = %workspace.display(), branch = %branch, "task admitted");
        true
    }

    /// Move due RetryScheduled tasks back to Pending.
    fn requeue_due_retries(&self) {
        let Ok(mut state) = self.state.lock() else {
            error!("task table lock poisoned, skipping retry scan");
            return;
        };
        let now = now_ms();
        let due: Vec<String> = state
            .table
            .tasks()
            .filter(|t| t.state == TaskState::RetryScheduled)
            .filter(|t| t.next_retry_at.is_none_or(|at| at <= now))
            .map(|t| t.id.clone())
            .collect();
        for task_id in due {
            match state.table.transition(&task_id, TaskState::Pending) {
                Ok(()) => info!(task_id = %task_id, "retry due, task requeued"),
                Err(e) => warn!(task_id = %task_id, error = %e, "retry requeue failed"),
            }
        }
        promote_ready(&mut state.table, self.journal.as_deref());
    }

    /// Join a finished worker's handle and drop its entry.
    async fn reap(&self, task_id: &str) {
        let handle = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.workers.remove(task_id).map(|worker| worker.handle)
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task_id = %task_id, error = %e, "worker task panicked");
            }
        }
    }
}

fn journal_record(journal: Option<&TaskJournal>, task_id: &str, event: &str, detail: serde_json::Value) {
    if let Some(journal) = journal {
        if let Err(e) = journal.record(task_id, event, detail) {
            warn!(task_id = %task_id, event, error = %e, "journal write failed");
        }
    }
}

/// Queue every Pending task whose dependencies are all Completed.
fn promote_ready(table: &mut TaskTable, journal: Option<&TaskJournal>) {
    let ready: Vec<String> = table
        .tasks()
        .filter(|t| t.state == TaskState::Pending && table.dependencies_met(t))
        .map(|t| t.id.clone())
        .collect();
    for task_id in ready {
        match table.transition(&task_id, TaskState::Queued) {
            Ok(()) => {
                debug!(task_id = %task_id, "task queued");
                journal_record(journal, &task_id, EVENT_QUEUED, json!({}));
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "queue promotion failed"),
        }
    }
}

/// Fail every transitive dependent that has not started yet.
fn fail_dependents(table: &mut TaskTable, journal: Option<&TaskJournal>, root_id: &str, verb: &str) {
    for dep_id in table.transitive_dependents(root_id) {
        let Some(task) = table.get(&dep_id) else {
            continue;
        };
        if task.state.is_terminal() || task.state == TaskState::Running {
            continue;
        }
        let message = format!("dependency {} {}", root_id, verb);
        if let Err(e) = table.transition(&dep_id, TaskState::Failed) {
            warn!(task_id = %dep_id, error = %e, "dependent transition failed");
            continue;
        }
        if let Some(task) = table.get_mut(&dep_id) {
            task.result = Some(ExecutionResult::failed(&dep_id, &message, 0, None));
            task.error_history.push(message.clone());
        }
        warn!(task_id = %dep_id, blocked_by = %root_id, "failing dependent task");
        journal_record(journal, &dep_id, EVENT_FAILED, json!({"reason": message}));
    }
}

/// Apply a finished worker's report to the table: terminal transition,
/// retry scheduling, dependency propagation, dependent promotion.
fn apply_report(state: &Mutex<SchedulerState>, journal: Option<&TaskJournal>, task_id: &str, report: ExecutionReport) {
    let Ok(mut state) = state.lock() else {
        error!(task_id = %task_id, "task table lock poisoned, dropping worker report");
        return;
    };

    for stage in &report.stages {
        journal_record(
            journal,
            task_id,
            EVENT_STAGE,
            json!({"stage": stage.stage, "success": stage.success, "duration-ms": stage.duration_ms}),
        );
    }

    {
        let Some(task) = state.table.get_mut(task_id) else {
            warn!(task_id = %task_id, "finished worker for unknown task");
            return;
        };
        task.stage_trail.extend(report.stages.iter().cloned());
    }

    match report.result.state {
        TaskState::Completed => {
            if let Err(e) = state.table.transition(task_id, TaskState::Completed) {
                warn!(task_id = %task_id, error = %e, "completion transition failed");
                return;
            }
            if let Some(task) = state.table.get_mut(task_id) {
                task.result = Some(report.result.clone());
            }
            info!(task_id = %task_id, duration_ms = report.result.duration_ms, "task completed");
            journal_record(
                journal,
                task_id,
                EVENT_COMPLETED,
                json!({"duration-ms": report.result.duration_ms, "artifact-url": report.result.artifact_url}),
            );
            promote_ready(&mut state.table, journal);
        }
        TaskState::Cancelled => {
            if let Err(e) = state.table.transition(task_id, TaskState::Cancelled) {
                warn!(task_id = %task_id, error = %e, "cancellation transition failed");
                return;
            }
            if let Some(task) = state.table.get_mut(task_id) {
                task.result = Some(report.result.clone());
            }
            info!(task_id = %task_id, "task cancelled");
            journal_record(journal, task_id, EVENT_CANCELLED, json!({"while": "running"}));
            fail_dependents(&mut state.table, journal, task_id, "was cancelled");
        }
        TaskState::Failed => {
            let Some((retry_count, max_retries, base_ms)) = state
                .table
                .get(task_id)
                .map(|t| (t.retry_count, t.max_retries, t.retry_delay_base_ms))
            else {
                return;
            };
            if retry_count < max_retries {
                let delay_ms = base_ms.saturating_mul(1u64 << retry_count.min(63));
                if let Err(e) = state.table.transition(task_id, TaskState::RetryScheduled) {
                    warn!(task_id = %task_id, error = %e, "retry transition failed");
                    return;
                }
                if let Some(task) = state.table.get_mut(task_id) {
                    // delay_ms can saturate past i64::MAX; never wrap into the past
                    task.next_retry_at =
                        Some(now_ms().saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX)));
                    task.retry_count += 1;
                    task.error_history.push(report.result.message.clone());
                }
                warn!(
                    task_id = %task_id,
                    attempt = retry_count + 1,
                    max_retries,
                    delay_ms,
                    error = %report.result.message,
                    "task failed, retry scheduled"
                );
                journal_record(
                    journal,
                    task_id,
                    EVENT_RETRY_SCHEDULED,
                    json!({"retry-count": retry_count + 1, "delay-ms": delay_ms}),
                );
            } else {
                if let Err(e) = state.table.transition(task_id, TaskState::Failed) {
                    warn!(task_id = %task_id, error = %e, "failure transition failed");
                    return;
                }
                if let Some(task) = state.table.get_mut(task_id) {
                    task.result = Some(report.result.clone());
                    task.error_history.push(report.result.message.clone());
                }
                error!(task_id = %task_id, error = %report.result.message, "task failed permanently");
                journal_record(journal, task_id, EVENT_FAILED, json!({"reason": report.result.message}));
                fail_dependents(&mut state.table, journal, task_id, "failed");
            }
        }
        other => {
            warn!(task_id = %task_id, state = %other, "worker produced a non-terminal result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::FixedPoolManager;
    use crate::stage::{MockPipeline, StageName};
    use crate::strategy::ParallelStrategy;
    use tempfile::TempDir;

    fn test_deps(
        pipeline: Arc<dyn StagePipeline>,
        max_concurrent: usize,
    ) -> (TempDir, Arc<FixedPoolManager>, Arc<Scheduler>) {
        let temp = TempDir::new().unwrap();
        let workspaces = Arc::new(WorkspaceManager::new(temp.path()));
        let resources = Arc::new(FixedPoolManager::new(8, 16, 32_768));
        let config = SchedulerConfig {
            poll_interval_ms: 20,
            retry_scan_interval_ms: 40,
            max_retries: 2,
            retry_delay_base_ms: 50,
        };
        let scheduler = Scheduler::new(
            Arc::new(ParallelStrategy::new(max_concurrent)),
            Arc::clone(&resources) as Arc<dyn ResourceManager>,
            pipeline,
            workspaces,
            config,
            Duration::from_millis(10),
            None,
        );
        (temp, resources, Arc::new(scheduler))
    }

    fn request(id: &str, priority: i64) -> TaskRequest {
        TaskRequest::new(id, id, priority)
    }

    fn request_with_deps(id: &str, deps: &[&str]) -> TaskRequest {
        let mut request = TaskRequest::new(id, id, 5);
        request.depends_on = deps.iter().map(|d| d.to_string()).collect();
        request
    }

    async fn wait_until_terminal(scheduler: &Scheduler, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if scheduler.all_terminal().unwrap() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "tasks did not reach a terminal state in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_queues_task_without_dependencies() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        assert!(scheduler.submit(request("a", 5)).unwrap());
        let task = scheduler.task_status("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert!(task.queued_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_leaves_gated_task_pending() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        scheduler.submit(request_with_deps("b", &["a"])).unwrap();

        let b = scheduler.task_status("b").unwrap().unwrap();
        assert_eq!(b.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        assert!(scheduler.submit(request("a", 5)).unwrap());
        assert!(!scheduler.submit(request("a", 5)).unwrap());
    }

    #[tokio::test]
    async fn test_force_resubmission_of_terminal_task() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        assert!(scheduler.cancel("a").unwrap());

        // Without force the terminal record blocks the id
        assert!(!scheduler.submit(request("a", 5)).unwrap());

        let mut forced = request("a", 7);
        forced.options.force = true;
        assert!(scheduler.submit(forced).unwrap());
        let task = scheduler.task_status("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.priority, 7);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_cycle() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        // b waits for a, which does not exist yet
        assert!(scheduler.submit(request_with_deps("b", &["a"])).unwrap());
        // a arriving with a dependency on b would close the loop
        assert!(!scheduler.submit(request_with_deps("a", &["b"])).unwrap());
        assert!(scheduler.task_status("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_waiting_task_is_terminal_and_idempotent() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        assert!(scheduler.cancel("a").unwrap());
        let task = scheduler.task_status("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.result.is_some());

        assert!(!scheduler.cancel("a").unwrap());
        assert!(!scheduler.cancel("ghost").unwrap());
    }

    #[tokio::test]
    async fn test_cancel_fails_waiting_dependents() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        scheduler.submit(request_with_deps("b", &["a"])).unwrap();
        scheduler.submit(request_with_deps("c", &["b"])).unwrap();

        scheduler.cancel("a").unwrap();

        let b = scheduler.task_status("b").unwrap().unwrap();
        assert_eq!(b.state, TaskState::Failed);
        assert_eq!(b.error_history, vec!["dependency a was cancelled"]);
        let c = scheduler.task_status("c").unwrap().unwrap();
        assert_eq!(c.state, TaskState::Failed);
        assert_eq!(c.error_history, vec!["dependency a was cancelled"]);
    }

    #[tokio::test]
    async fn test_set_priority_only_before_start() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        assert!(scheduler.set_priority("a", 9).unwrap());
        assert_eq!(scheduler.task_status("a").unwrap().unwrap().priority, 9);

        scheduler.cancel("a").unwrap();
        assert!(!scheduler.set_priority("a", 1).unwrap());
        assert!(!scheduler.set_priority("ghost", 1).unwrap());
    }

    #[tokio::test]
    async fn test_add_dependency_guards() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        scheduler.submit(request("b", 5)).unwrap();
        scheduler.submit(request("c", 5)).unwrap();

        assert!(scheduler.add_dependency("b", "a").unwrap());
        // Repeated edge is accepted without duplicating anything
        assert!(scheduler.add_dependency("b", "a").unwrap());
        let a = scheduler.task_status("a").unwrap().unwrap();
        assert!(a.blocks.contains("b"));

        // Cycle back to a
        assert!(!scheduler.add_dependency("a", "b").unwrap());
        // Unknown ids
        assert!(!scheduler.add_dependency("ghost", "a").unwrap());
        assert!(!scheduler.add_dependency("a", "ghost").unwrap());

        // A dependency that already ended in failure is refused
        scheduler.cancel("c").unwrap();
        assert!(!scheduler.add_dependency("b", "c").unwrap());
    }

    #[tokio::test]
    async fn test_add_dependency_re_blocks_queued_task() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.submit(request("a", 5)).unwrap();
        scheduler.submit(request("b", 5)).unwrap();
        assert_eq!(scheduler.task_status("b").unwrap().unwrap().state, TaskState::Queued);

        assert!(scheduler.add_dependency("b", "a").unwrap());
        assert_eq!(scheduler.task_status("b").unwrap().unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_queue_status_counts() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 3);

        scheduler.submit(request("a", 5)).unwrap();
        scheduler.submit(request("b", 5)).unwrap();
        scheduler.submit(request_with_deps("c", &["a"])).unwrap();

        let status = scheduler.queue_status().unwrap();
        assert_eq!(status.queue_size, 2);
        // pending_count covers everything awaiting admission, gated or not
        assert_eq!(status.pending_count, 3);
        assert_eq!(status.pending_count, status.pending_ids.len());
        assert_eq!(status.running_count, 0);
        assert_eq!(status.max_concurrent, 3);
        assert!(status.running_ids.is_empty());
    }

    #[tokio::test]
    async fn test_submit_batch_reports_per_request() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        let accepted = scheduler
            .submit_batch(vec![request("a", 5), request("a", 5), request("b", 5)])
            .unwrap();
        assert_eq!(accepted, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_run_completes_submitted_tasks() {
        let pipeline = Arc::new(MockPipeline::succeeding());
        let (_temp, resources, scheduler) = test_deps(Arc::clone(&pipeline) as Arc<dyn StagePipeline>, 2);

        scheduler.submit(request("a", 5)).unwrap();
        scheduler.submit(request("b", 8)).unwrap();

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };
        wait_until_terminal(&scheduler, Duration::from_secs(5)).await;
        scheduler.shutdown(false).await;
        runner.await.unwrap().unwrap();

        for id in ["a", "b"] {
            let task = scheduler.task_status(id).unwrap().unwrap();
            assert_eq!(task.state, TaskState::Completed, "task {}", id);
            assert!(task.started_at.is_some());
            assert!(task.result.as_ref().is_some_and(|r| r.success));
            assert_eq!(task.stage_trail.len(), 8);
        }
        // Every reservation was returned
        assert_eq!(resources.available_capacity().available_slots, 8);
    }

    #[tokio::test]
    async fn test_run_rejects_second_caller() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = scheduler.run().await;
        assert!(second.is_err());

        scheduler.shutdown(false).await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_work() {
        let pipeline =
            Arc::new(MockPipeline::succeeding().with_stage_delay(StageName::Monitor, Duration::from_secs(30)));
        let (_temp, resources, scheduler) = test_deps(pipeline, 2);

        scheduler.submit(request("slow", 5)).unwrap();
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        // Wait for the worker to reach the delayed stage
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = scheduler.task_status("slow").unwrap().unwrap();
            if task.state == TaskState::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        scheduler.shutdown(true).await;
        runner.await.unwrap().unwrap();

        let task = scheduler.task_status("slow").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.stage_trail.iter().any(|s| s.stage == "cleanup"));
        assert_eq!(resources.available_capacity().available_slots, 8);
    }

    #[tokio::test]
    async fn test_retry_then_permanent_failure() {
        // agent_spawn fails on every attempt of every run; with
        // max_retries 2 the task runs three times and then fails for good
        let pipeline = Arc::new(MockPipeline::always_failing(StageName::AgentSpawn));
        let (_temp, resources, scheduler) = test_deps(pipeline, 2);

        scheduler.submit(request("doomed", 5)).unwrap();
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };
        wait_until_terminal(&scheduler, Duration::from_secs(30)).await;
        scheduler.shutdown(false).await;
        runner.await.unwrap().unwrap();

        let task = scheduler.task_status("doomed").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_history.len(), 3);
        assert!(task.error_history.iter().all(|e| e.contains("agent_spawn")));
        assert_eq!(resources.available_capacity().available_slots, 8);
    }

    struct ExplodingPipeline;

    #[async_trait::async_trait]
    impl StagePipeline for ExplodingPipeline {
        async fn run_stage(&self, name: StageName, _ctx: &StageContext) -> Result<String> {
            if name == StageName::AgentSpawn {
                panic!("agent runtime tore down");
            }
            Ok(format!("{} ok", name))
        }
    }

    #[tokio::test]
    async fn test_panicking_stage_leaves_no_task_in_limbo() {
        let (_temp, resources, scheduler) = test_deps(Arc::new(ExplodingPipeline), 2);

        let mut volatile = request("volatile", 5);
        volatile.max_retries = Some(0);
        scheduler.submit(volatile).unwrap();

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };
        wait_until_terminal(&scheduler, Duration::from_secs(10)).await;
        scheduler.shutdown(false).await;
        runner.await.unwrap().unwrap();

        let task = scheduler.task_status("volatile").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error_history.iter().any(|e| e.contains("panicked")));
        assert!(task.stage_trail.iter().any(|s| s.stage == "cleanup"));
        // The reservation came back despite the panic
        assert_eq!(resources.available_capacity().available_slots, 8);
    }

    #[test]
    fn test_retry_schedule_saturates_instead_of_wrapping() {
        let mut flaky = request("a", 5);
        flaky.max_retries = Some(80);
        flaky.retry_delay_base_ms = Some(60_000);
        let mut task = Task::from_request(flaky, 2, 1_000);
        task.state = TaskState::Running;
        task.retry_count = 70;

        let mut table = TaskTable::new();
        table.insert(task).unwrap();
        let state = Mutex::new(SchedulerState {
            table,
            workers: HashMap::new(),
            admissions_paused: false,
        });

        let before = now_ms();
        let report = ExecutionReport {
            result: ExecutionResult::failed("a", "stage agent_spawn failed", 10, None),
            stages: vec![],
        };
        apply_report(&state, None, "a", report);

        let state = state.lock().unwrap();
        let task = state.table.get("a").unwrap();
        assert_eq!(task.state, TaskState::RetryScheduled);
        assert_eq!(task.retry_count, 71);
        // 60000 ms doubled 63+ times saturates; the schedule must stay in the future
        assert!(task.next_retry_at.is_some_and(|at| at >= before));
    }

    #[tokio::test]
    async fn test_pause_blocks_admissions() {
        let (_temp, _resources, scheduler) = test_deps(Arc::new(MockPipeline::succeeding()), 2);

        scheduler.pause_admissions();
        scheduler.submit(request("a", 5)).unwrap();

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            scheduler.task_status("a").unwrap().unwrap().state,
            TaskState::Queued,
            "paused scheduler must not admit"
        );

        scheduler.resume_admissions();
        wait_until_terminal(&scheduler, Duration::from_secs(5)).await;
        scheduler.shutdown(false).await;
        runner.await.unwrap().unwrap();
        assert_eq!(scheduler.task_status("a").unwrap().unwrap().state, TaskState::Completed);
    }
}
