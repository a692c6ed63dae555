//! On-disk layout shared by the dispatcher, the child runner, and the reaper.
//!
//! ```text
//! <state_dir>/
//!   pids/{pid}.pid              ProcessRecord JSON, one per tracked child
//!   payloads/fibril_<uuid>.json Payload JSON, consumed once by the child
//!   payloads/fibril_<uuid>.log  optional captured child output
//! ```
//!
//! Distinct file names are the only coordination between processes; nothing here
//! takes a lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use fibril_config::ProcessConfig;
use fibril_types::{PID_FILE_EXTENSION, Payload, Pid, ProcessRecord};
use fibril_utils::{atomic_write, atomic_write_new, ensure_dir, remove_if_exists};

pub const PIDS_DIR: &str = "pids";
pub const PAYLOADS_DIR: &str = "payloads";

const PAYLOAD_PREFIX: &str = "fibril_";
const PAYLOAD_EXTENSION: &str = "json";
const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDirs {
    root: PathBuf,
}

impl StateDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(config.state_dir())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn pids(&self) -> PidStore {
        PidStore {
            dir: self.root.join(PIDS_DIR),
        }
    }

    #[must_use]
    pub fn payloads(&self) -> PayloadStore {
        PayloadStore {
            dir: self.root.join(PAYLOADS_DIR),
        }
    }

    /// Create both directories, best-effort.
    pub fn ensure(&self) {
        ensure_dir(self.pids().dir());
        ensure_dir(self.payloads().dir());
    }
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// `pids/` directory: one JSON record per tracked child.
#[derive(Debug, Clone)]
pub struct PidStore {
    dir: PathBuf,
}

impl PidStore {
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, pid: Pid) -> PathBuf {
        self.dir.join(pid.record_file_name())
    }

    /// Persist `record`, replacing any leftover file for a reused PID.
    pub fn write(&self, record: &ProcessRecord) -> io::Result<PathBuf> {
        let path = self.path_for(record.pid);
        let bytes = serde_json::to_vec_pretty(record).map_err(invalid_data)?;
        atomic_write(&path, &bytes)?;
        Ok(path)
    }

    pub fn read(&self, pid: Pid) -> io::Result<ProcessRecord> {
        Self::read_path(&self.path_for(pid))
    }

    pub fn read_path(path: &Path) -> io::Result<ProcessRecord> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(invalid_data)
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.path_for(pid).is_file()
    }

    pub fn remove(&self, pid: Pid) -> io::Result<bool> {
        remove_if_exists(&self.path_for(pid))
    }

    /// Tracking files, sorted by PID. A missing directory has no entries.
    pub fn entries(&self) -> io::Result<Vec<(Pid, PathBuf)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if let Some(pid) = ProcessRecord::pid_from_path(&path) {
                entries.push((pid, path));
            }
        }
        entries.sort_by_key(|(pid, _)| *pid);
        Ok(entries)
    }

    /// Number of tracking files. Unreadable directories count as empty.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries().map_or(0, |entries| entries.len())
    }
}

/// `payloads/` directory: signed payload files and their output logs.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `payload` under a fresh random name.
    pub fn create(&self, payload: &Payload) -> io::Result<PathBuf> {
        let name = format!(
            "{PAYLOAD_PREFIX}{}.{PAYLOAD_EXTENSION}",
            Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);
        let bytes = serde_json::to_vec(payload).map_err(invalid_data)?;
        atomic_write_new(&path, &bytes)?;
        Ok(path)
    }

    pub fn read(path: &Path) -> io::Result<Payload> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(invalid_data)
    }

    /// Whether `path` resolves to a file inside this directory.
    ///
    /// Both sides are canonicalised, so `..` segments and symlinks pointing
    /// elsewhere are rejected. Missing files are never contained.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        let (Ok(dir), Ok(file)) = (self.dir.canonicalize(), path.canonicalize()) else {
            return false;
        };
        file.starts_with(&dir) && file != dir
    }

    /// Sibling output log for a payload file.
    #[must_use]
    pub fn log_path_for(payload_path: &Path) -> PathBuf {
        payload_path.with_extension(LOG_EXTENSION)
    }

    /// Payload files (not logs) currently on disk.
    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(PAYLOAD_EXTENSION)
                && path.is_file()
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
