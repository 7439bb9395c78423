//! Command-line definition.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use queuectl_core::JobState;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Background job queue: enqueue shell commands, run workers, inspect the DLQ")]
#[command(version)]
pub struct Args {
    /// Config file (default: queuectl.toml, or $QUEUECTL_CONFIG)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format instead of human-readable tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a job
    Enqueue(EnqueueArgs),
    /// List jobs, optionally filtered by state
    List {
        #[arg(long, short = 's', value_parser = parse_state)]
        state: Option<JobState>,
    },
    /// Job counts per state and active workers
    Status,
    /// Attempt and duration aggregates
    Metrics,
    /// Dead letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Queue settings (backoff_base, default_max_retries)
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Worker process management
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Return jobs stuck in processing back to pending
    Reap {
        /// Lease age in seconds after which a processing job is reclaimed
        #[arg(long)]
        older_than: u64,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct EnqueueArgs {
    /// Job as a JSON object, e.g. '{"id":"job1","command":"sleep 2"}'; `-` reads stdin
    #[arg(value_name = "JSON")]
    pub job: Option<String>,

    /// Shell command to run (when not passing JSON)
    #[arg(long, conflicts_with = "job")]
    pub command: Option<String>,

    #[arg(long)]
    pub id: Option<String>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Higher runs first
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i64>,

    /// RFC 3339 timestamp or epoch seconds
    #[arg(long)]
    pub run_at: Option<String>,

    /// Kill the command after this many seconds
    #[arg(long)]
    pub timeout: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum DlqAction {
    /// List dead jobs
    List,
    /// Reset a dead job to pending with zero attempts
    Retry { id: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[derive(Subcommand, Debug)]
pub enum WorkerAction {
    /// Spawn detached worker processes
    Start {
        #[arg(long, short = 'n', default_value = "1")]
        count: usize,
    },
    /// Send SIGTERM to every recorded worker
    Stop,
    /// Recorded workers that are still running
    List,
    /// Run a worker loop in this process
    #[command(hide = true)]
    Run,
}

fn parse_state(raw: &str) -> Result<JobState, String> {
    raw.parse::<JobState>().map_err(|e| e.to_string())
}
