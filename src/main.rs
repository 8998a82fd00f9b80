use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stagehand::cli::{Cli, Commands};
use stagehand::config::GlobalConfig;
use stagehand::journal::TaskJournal;
use stagehand::resource::FixedPoolManager;
use stagehand::scheduler::Scheduler;
use stagehand::stage::CommandPipeline;
use stagehand::strategy::{StrategyKind, strategy_for};
use stagehand::task::{Task, TaskRequest, TaskState, priority_name};
use stagehand::workspace::WorkspaceManager;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stagehand")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("stagehand.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Task file layout: a single `tasks` list of submission requests.
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskRequest>,
}

fn load_task_file(path: &Path) -> Result<Vec<TaskRequest>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;
    let file: TaskFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse task file: {}", path.display()))?;
    if file.tasks.is_empty() {
        eyre::bail!("task file {} contains no tasks", path.display());
    }
    Ok(file.tasks)
}

fn build_strategy(config: &GlobalConfig) -> Result<Arc<dyn stagehand::strategy::ExecutionStrategy>> {
    let kind: StrategyKind = config.strategy.kind.parse().map_err(|e: String| eyre::eyre!(e))?;
    Ok(strategy_for(
        kind,
        config.strategy.max_concurrent,
        Duration::from_secs(config.strategy.boost_threshold_secs),
    ))
}

fn build_scheduler(config: &GlobalConfig) -> Result<Arc<Scheduler>> {
    let strategy = build_strategy(config)?;
    let workspaces = Arc::new(WorkspaceManager::new(&config.stages.workspace_root));
    let resources = Arc::new(FixedPoolManager::new(
        config.resources.slots,
        config.resources.cpu_cores,
        config.resources.memory_mb,
    ));
    let pipeline = Arc::new(CommandPipeline::new(Arc::clone(&workspaces), config.stages.clone()));
    let journal = if config.journal.enabled {
        let journal = TaskJournal::open(&config.journal.dir).context("Failed to open task journal")?;
        info!("Journal at {}", journal.path().display());
        Some(Arc::new(journal))
    } else {
        None
    };

    Ok(Arc::new(Scheduler::new(
        strategy,
        resources,
        pipeline,
        workspaces,
        config.scheduler.clone(),
        config.stages.monitor_poll_interval(),
        journal,
    )))
}

async fn handle_run_command(tasks_path: &Path, config: &GlobalConfig, dry_run: bool) -> Result<()> {
    let mut requests = load_task_file(tasks_path)?;
    if dry_run {
        for request in &mut requests {
            request.options.dry_run = true;
        }
    }
    let task_ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();

    let scheduler = build_scheduler(config)?;
    let accepted = scheduler.submit_batch(requests)?;
    let admitted = accepted.iter().filter(|ok| **ok).count();
    println!("{} {} of {} tasks accepted", "Submitted:".green(), admitted, accepted.len());
    for (task_id, ok) in task_ids.iter().zip(accepted.iter()) {
        if !*ok {
            println!("  {} {}", "rejected:".red(), task_id);
        }
    }
    if admitted == 0 {
        eyre::bail!("no tasks accepted from {}", tasks_path.display());
    }

    info!("Running {} tasks with {} strategy", admitted, config.strategy.kind);
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    let mut cancel_running = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "Interrupted, cancelling running tasks...".yellow());
                cancel_running = true;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if scheduler.all_terminal()? {
                    break;
                }
            }
        }
    }
    scheduler.shutdown(cancel_running).await;
    runner.await.context("Scheduler loop panicked")??;

    print_summary(&scheduler, &task_ids)
}

fn print_summary(scheduler: &Scheduler, task_ids: &[String]) -> Result<()> {
    println!("\n{}", "Execution summary:".bold());
    for task_id in task_ids {
        let Some(task) = scheduler.task_status(task_id)? else {
            continue;
        };
        let label = match task.state {
            TaskState::Completed => "completed".green(),
            TaskState::Failed => "failed".red(),
            TaskState::Cancelled => "cancelled".yellow(),
            _ => "unfinished".normal(),
        };
        let duration_ms = task.result.as_ref().map(|r| r.duration_ms).unwrap_or(0);
        println!("  {:<24} {} ({} ms)", task_id, label, duration_ms);
        if let Some(result) = &task.result {
            if let Some(artifact) = &result.artifact_url {
                println!("    {} {}", "artifact:".cyan(), artifact);
            }
            if !result.success && task.state == TaskState::Failed {
                println!("    {} {}", "error:".red(), result.message);
            }
        }
    }

    let stats = scheduler.execution_stats()?;
    println!("\n{}", "Statistics:".bold());
    println!("  Tasks:        {}", stats.total_tasks);
    println!("  Success rate: {:.1}%", stats.success_rate);
    println!("  Average time: {:.0} ms", stats.average_execution_time_ms);
    println!("  Throughput:   {:.2} tasks/hour", stats.tasks_per_hour);
    Ok(())
}

fn handle_order_command(tasks_path: &Path, config: &GlobalConfig) -> Result<()> {
    let requests = load_task_file(tasks_path)?;
    let strategy = build_strategy(config)?;
    let tasks: Vec<Task> = requests
        .into_iter()
        .map(|r| Task::from_request(r, config.scheduler.max_retries, config.scheduler.retry_delay_base_ms))
        .collect();
    let ordered = strategy.order(&tasks);

    println!("{} {} tasks, {} strategy", "Admission order:".bold(), ordered.len(), strategy.name());
    for (position, task) in ordered.iter().enumerate() {
        let band = match priority_name(task.priority) {
            "critical" => "critical".red(),
            "high" => "high".yellow(),
            "medium" => "medium".normal(),
            other => other.dimmed(),
        };
        println!(
            "{:>3}. {:<24} priority {:>2} ({}) effective {}",
            position + 1,
            task.id,
            task.priority,
            band,
            strategy.effective_priority(task),
        );
    }
    Ok(())
}

async fn run_application(cli: &Cli, mut config: GlobalConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            tasks,
            strategy,
            max_concurrent,
            dry_run,
            workspace_root,
        } => {
            if let Some(kind) = strategy {
                config.strategy.kind = kind.clone();
            }
            if let Some(limit) = max_concurrent {
                config.strategy.max_concurrent = *limit;
            }
            if let Some(root) = workspace_root {
                config.stages.workspace_root = root.clone();
            }
            config.validate().context("Invalid configuration")?;
            handle_run_command(tasks, &config, *dry_run).await
        }
        Commands::Order { tasks, strategy } => {
            if let Some(kind) = strategy {
                config.strategy.kind = kind.clone();
            }
            config.validate().context("Invalid configuration")?;
            handle_order_command(tasks, &config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();

    let config = GlobalConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    run_application(&cli, config).await
}
