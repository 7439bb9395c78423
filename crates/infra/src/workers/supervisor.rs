//! Worker process supervisor.
//!
//! Spawns detached `queuectl worker run` processes, records their pids and
//! later sends each one SIGTERM. Both operations are best-effort per process:
//! one failed spawn or signal is logged and the sweep continues.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::pid_registry::PidRegistry;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("pid registry I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pid registry encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot locate worker executable: {0}")]
    Executable(#[source] std::io::Error),
}

/// OS process operations the supervisor needs.
pub trait ProcessControl: Send + Sync {
    /// Start one detached worker process and return its pid.
    fn spawn_worker(&self) -> std::io::Result<u32>;

    /// Ask a worker to drain and exit.
    fn terminate(&self, pid: u32) -> std::io::Result<()>;

    /// Whether `pid` still refers to a running process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real processes: `<program> <args...>` in its own process group, signals via `kill(2)`.
#[derive(Debug, Clone)]
pub struct OsProcessControl {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl OsProcessControl {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Re-invoke the current executable as `worker run`.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::Executable)?;
        Ok(Self::new(program, vec!["worker".to_string(), "run".to_string()]))
    }

    /// Extra environment passed to every spawned worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl ProcessControl for OsProcessControl {
    fn spawn_worker(&self) -> std::io::Result<u32> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        // Not waited on: the worker outlives this process.
        let child = cmd.spawn()?;
        Ok(child.id())
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signalling workers is only supported on unix",
        ))
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // EPERM means the process exists but belongs to someone else.
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Outcome of a stop sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub signalled: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

/// Starts, lists and stops worker processes.
pub struct WorkerSupervisor<P: ProcessControl> {
    control: P,
    registry: PidRegistry,
}

impl<P: ProcessControl> WorkerSupervisor<P> {
    pub fn new(control: P, registry: PidRegistry) -> Self {
        Self { control, registry }
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    /// Spawn `count` workers and record the ones that started.
    pub fn start(&self, count: usize) -> Result<Vec<u32>, SupervisorError> {
        let mut spawned = Vec::with_capacity(count);
        for n in 0..count {
            match self.control.spawn_worker() {
                Ok(pid) => {
                    info!(pid, "spawned worker");
                    spawned.push(pid);
                }
                Err(err) => warn!(worker = n, error = %err, "failed to spawn worker"),
            }
        }
        if !spawned.is_empty() {
            self.registry.append(&spawned)?;
        }
        Ok(spawned)
    }

    /// SIGTERM every recorded worker, then clear the registry regardless of
    /// individual signal results.
    pub fn stop(&self) -> Result<StopReport, SupervisorError> {
        let pids = self.registry.load();
        let mut report = StopReport::default();
        for pid in pids {
            match self.control.terminate(pid) {
                Ok(()) => {
                    info!(pid, "sent SIGTERM to worker");
                    report.signalled.push(pid);
                }
                Err(err) => {
                    warn!(pid, error = %err, "failed to signal worker");
                    report.failed.push((pid, err.to_string()));
                }
            }
        }
        self.registry.clear()?;
        Ok(report)
    }

    /// Recorded workers that are still running.
    pub fn list_active(&self) -> Vec<u32> {
        self.registry
            .load()
            .into_iter()
            .filter(|pid| self.control.is_alive(*pid))
            .collect()
    }
}
