//! Infrastructure layer: job persistence, settings, command execution and
//! worker processes.

pub mod config;
pub mod db;
pub mod exec;
pub mod jobs;
pub mod settings;
pub mod workers;

#[cfg(test)]
mod integration_tests;
