//! `queuectl` front end: argument parsing and command dispatch.

pub mod cli;
pub mod commands;

use std::io;

use anyhow::Context;
use tracing::info;

use queuectl_infra::config::{CONFIG_FILE_ENV, QueueConfig};
use queuectl_infra::workers::{OsProcessControl, PidRegistry, WorkerSupervisor};
use queuectl_observability::LogFormat;

use crate::cli::{Args, Command, ConfigAction, DlqAction, WorkerAction};
use crate::commands::Queue;

fn load_config(args: &Args) -> anyhow::Result<QueueConfig> {
    match &args.config {
        Some(path) => QueueConfig::load_from(path),
        None => QueueConfig::load(),
    }
}

fn supervisor(args: &Args, config: &QueueConfig) -> anyhow::Result<WorkerSupervisor<OsProcessControl>> {
    let mut control = OsProcessControl::current_exe()?;
    // Spawned workers must read the same config file as this process.
    if let Some(path) = &args.config {
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("config file {} not found", path.display()))?;
        control = control.with_env(CONFIG_FILE_ENV, path.to_string_lossy());
    }
    Ok(WorkerSupervisor::new(control, PidRegistry::new(config.pid_file())))
}

/// Execute one invocation.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let worker_process = matches!(
        args.command,
        Command::Worker {
            action: WorkerAction::Run
        }
    );
    if worker_process {
        queuectl_observability::init_with(config.log_format);
    } else {
        queuectl_observability::init_with(LogFormat::Pretty);
    }

    let json = args.json;
    let mut stdout = io::stdout();
    let out: &mut dyn io::Write = &mut stdout;

    match &args.command {
        Command::Worker { action } => match action {
            WorkerAction::Run => {
                let stats = commands::run_worker(config).await?;
                info!(jobs_processed = stats.jobs_processed, "worker process exiting");
                Ok(())
            }
            WorkerAction::Start { count } => {
                commands::worker_start(&supervisor(&args, &config)?, *count, out, json)
            }
            WorkerAction::Stop => commands::worker_stop(&supervisor(&args, &config)?, out, json),
            WorkerAction::List => commands::worker_list(&supervisor(&args, &config)?, out, json),
        },
        Command::Status => {
            let active = supervisor(&args, &config)?.list_active();
            let queue = Queue::open(config).await?;
            commands::status(&queue, active, out, json).await
        }
        Command::Enqueue(enqueue) => {
            let request = commands::build_request(enqueue.clone(), &mut io::stdin())?;
            let queue = Queue::open(config).await?;
            commands::enqueue(&queue, request, out, json).await
        }
        Command::List { state } => {
            let queue = Queue::open(config).await?;
            commands::list(&queue, *state, out, json).await
        }
        Command::Metrics => {
            let queue = Queue::open(config).await?;
            commands::metrics(&queue, out, json).await
        }
        Command::Dlq { action } => {
            let queue = Queue::open(config).await?;
            match action {
                DlqAction::List => commands::dlq_list(&queue, out, json).await,
                DlqAction::Retry { id } => commands::dlq_retry(&queue, id, out, json).await,
            }
        }
        Command::Config { action } => {
            let queue = Queue::open(config).await?;
            match action {
                ConfigAction::Get { key } => commands::config_get(&queue, key, out).await,
                ConfigAction::Set { key, value } => commands::config_set(&queue, key, value, out).await,
                ConfigAction::List => commands::config_list(&queue, out, json).await,
            }
        }
        Command::Reap { older_than } => {
            let queue = Queue::open(config).await?;
            commands::reap(&queue, *older_than, out, json).await
        }
    }
}
