//! `sh -c` runner with process-group timeout enforcement.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandRunner, ExecError, ExecutionOutcome};

/// How long to keep draining pipes after the process group was killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(1);

/// Runs commands through the system shell.
///
/// Each command gets its own process group so a timeout kills the whole
/// pipeline, not just the shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome, ExecError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
        let pid = child.id();
        debug!(pid, "command spawned");

        let stdout = tokio::spawn(read_stream(child.stdout.take()));
        let stderr = tokio::spawn(read_stream(child.stderr.take()));

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let (exit_code, timed_out) = match waited {
            Some(status) => (status.map_err(ExecError::Wait)?.code(), false),
            None => {
                warn!(pid, timeout_secs = timeout.map(|t| t.as_secs()), "command timed out; killing process group");
                kill_process_group(pid);
                if let Err(err) = child.kill().await {
                    debug!(pid, error = %err, "shell already gone after group kill");
                }
                (None, true)
            }
        };

        let (stdout, stderr) = if timed_out {
            (
                tokio::time::timeout(DRAIN_AFTER_KILL, stdout).await.ok(),
                tokio::time::timeout(DRAIN_AFTER_KILL, stderr).await.ok(),
            )
        } else {
            (Some(stdout.await), Some(stderr.await))
        };

        Ok(ExecutionOutcome {
            exit_code,
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
            timed_out,
        })
    }
}

async fn read_stream<R>(stream: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

type Captured = Result<std::io::Result<Vec<u8>>, tokio::task::JoinError>;

fn collect(captured: Option<Captured>) -> Result<String, ExecError> {
    match captured {
        // Still held open by an escaped descendant.
        None => Ok(String::new()),
        Some(Ok(Ok(bytes))) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Some(Ok(Err(err))) => Err(ExecError::Capture(err.to_string())),
        Some(Err(err)) => Err(ExecError::Capture(err.to_string())),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %err, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
