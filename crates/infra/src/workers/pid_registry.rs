//! Best-effort record of spawned worker pids (`<runtime_dir>/workers.json`).
//!
//! Read-modify-write of the file is not atomic across supervisors. Losing an
//! entry only means `worker stop` misses that process; job state never depends
//! on this file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::supervisor::SupervisorError;

/// JSON array of pids on disk.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    path: PathBuf,
}

impl PidRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded pids. A missing file is empty; an unreadable or corrupt file is
    /// treated as empty with a warning.
    pub fn load(&self) -> Vec<u32> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read worker pid file");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(pids) => pids,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring corrupt worker pid file");
                Vec::new()
            }
        }
    }

    /// Replace the recorded pids.
    pub fn save(&self, pids: &[u32]) -> Result<(), SupervisorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SupervisorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let body = serde_json::to_string_pretty(pids)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|source| SupervisorError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| SupervisorError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Add newly spawned pids to whatever is already recorded.
    pub fn append(&self, spawned: &[u32]) -> Result<Vec<u32>, SupervisorError> {
        let mut pids = self.load();
        for pid in spawned {
            if !pids.contains(pid) {
                pids.push(*pid);
            }
        }
        self.save(&pids)?;
        Ok(pids)
    }

    /// Forget every recorded pid.
    pub fn clear(&self) -> Result<(), SupervisorError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SupervisorError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
