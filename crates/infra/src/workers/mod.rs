//! Worker processes: the execution loop each one runs, and the supervisor
//! that starts and stops them.

pub mod pid_registry;
pub mod supervisor;
pub mod worker_loop;

pub use pid_registry::PidRegistry;
pub use supervisor::{OsProcessControl, ProcessControl, StopReport, SupervisorError, WorkerSupervisor};
pub use worker_loop::{
    ShutdownHandle, TickOutcome, Worker, WorkerConfig, WorkerStats, shutdown_channel,
};
