//! Command execution capability used by the worker loop.
//!
//! The loop only sees [`CommandRunner`]; the real implementation is
//! [`ShellRunner`], tests substitute scripted runners.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod shell;

pub use shell::ShellRunner;

/// Result of running one job command to completion (or to its timeout).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Exit code, absent when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Failures to run a command at all. These are routed through the retry
/// policy exactly like a nonzero exit.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed waiting for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to capture command output: {0}")]
    Capture(String),
}

/// Runs a job's shell command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` and wait for it, killing it once `timeout` elapses.
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome, ExecError>;
}
