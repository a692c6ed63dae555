//! Listing, stale-record reclamation, and termination of tracked children.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tokio::time;

use fibril_config::FibrilConfig;
use fibril_types::{Liveness, Pid, ProcessRecord};
use fibril_utils::{
    KillOutcome, Signal, is_process_alive, probe_liveness, remove_if_exists, terminate,
};

use crate::state::{PayloadStore, PidStore, StateDirs};

const EXIT_POLL: Duration = Duration::from_millis(20);
const FORCED_EXIT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("PID {0} is not managed by fibril or has already been removed")]
    NotManaged(Pid),
    #[error("PID {0} now belongs to a different process; refusing to signal it")]
    PidReused(Pid),
    #[error("PID {0} is still alive after a forced kill")]
    StillAlive(Pid),
    #[error("failed to signal PID {pid}: {source}")]
    Signal { pid: Pid, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillResult {
    /// The process was signalled and is gone. `forced` means SIGKILL was needed.
    Terminated { forced: bool },
    /// The record pointed at a process that had already exited.
    AlreadyExited,
}

/// A tracked child as seen by `list`.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub liveness: Liveness,
    /// `None` when the tracking file could not be parsed.
    pub record: Option<ProcessRecord>,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Reaper {
    dirs: StateDirs,
    payload_ttl: Duration,
    kill_grace: Duration,
}

impl Reaper {
    #[must_use]
    pub fn new(dirs: StateDirs, payload_ttl: Duration, kill_grace: Duration) -> Self {
        Self {
            dirs,
            payload_ttl,
            kill_grace,
        }
    }

    #[must_use]
    pub fn from_config(config: &FibrilConfig) -> Self {
        Self::new(
            StateDirs::from_config(&config.process),
            config.process.payload_ttl(),
            config.process.kill_grace(),
        )
    }

    #[must_use]
    pub fn state_dirs(&self) -> &StateDirs {
        &self.dirs
    }

    fn pids(&self) -> PidStore {
        self.dirs.pids()
    }

    pub fn list(&self) -> io::Result<Vec<ProcessEntry>> {
        let entries = self.pids().entries()?;
        Ok(entries
            .into_iter()
            .map(|(pid, path)| {
                let record = match PidStore::read_path(&path) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), "Unreadable PID record: {e}");
                        None
                    }
                };
                let fingerprint = record.as_ref().and_then(|r| r.started_at_ms);
                ProcessEntry {
                    pid,
                    liveness: probe_liveness(pid.value(), fingerprint),
                    record,
                    path,
                }
            })
            .collect())
    }

    /// Remove records whose process has exited or whose PID was reused.
    pub fn clean_stale(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in self.list()? {
            if entry.liveness.is_tracked_alive() {
                continue;
            }
            if remove_if_exists(&entry.path)? {
                tracing::debug!(
                    pid = entry.pid.value(),
                    liveness = %entry.liveness,
                    "Removed stale PID record"
                );
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove payload files (and their logs) older than the configured TTL.
    pub fn clean_payloads(&self) -> io::Result<usize> {
        self.clean_payloads_older_than(self.payload_ttl)
    }

    pub fn clean_payloads_older_than(&self, max_age: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for path in self.dirs.payloads().files()? {
            if !is_older_than(&path, now, max_age) {
                continue;
            }
            if remove_if_exists(&path)? {
                removed += 1;
            }
            remove_if_exists(&PayloadStore::log_path_for(&path))?;
        }
        Ok(removed)
    }

    /// Stale-record reclamation only; payloads are left alone.
    pub fn optimize(&self) -> io::Result<usize> {
        self.clean_stale()
    }

    /// Terminate a tracked child: SIGTERM, then SIGKILL after the grace period.
    ///
    /// PIDs without a tracking record are refused before any signal is sent.
    pub async fn kill(&self, pid: Pid) -> Result<KillResult, ReaperError> {
        let pids = self.pids();
        let record_path = pids.path_for(pid);
        if !record_path.is_file() {
            return Err(ReaperError::NotManaged(pid));
        }
        let fingerprint = pids.read(pid).ok().and_then(|r| r.started_at_ms);
        let raw = pid.value();

        match probe_liveness(raw, fingerprint) {
            Liveness::Dead => {
                pids.remove(pid)?;
                return Ok(KillResult::AlreadyExited);
            }
            Liveness::PidReused => return Err(ReaperError::PidReused(pid)),
            Liveness::Alive => {}
        }

        let graceful = terminate(raw, Signal::Graceful);
        match &graceful {
            Ok(KillOutcome::NotRunning) => {
                pids.remove(pid)?;
                return Ok(KillResult::AlreadyExited);
            }
            Ok(KillOutcome::Signalled) => {
                if wait_for_exit(raw, self.kill_grace).await {
                    pids.remove(pid)?;
                    tracing::info!(pid = raw, "Terminated process");
                    return Ok(KillResult::Terminated { forced: false });
                }
            }
            Err(e) => tracing::warn!(pid = raw, "Graceful termination failed: {e}"),
        }

        terminate(raw, Signal::Forced).map_err(|source| ReaperError::Signal { pid, source })?;
        if !wait_for_exit(raw, FORCED_EXIT_WAIT).await {
            return Err(ReaperError::StillAlive(pid));
        }
        pids.remove(pid)?;
        tracing::info!(pid = raw, "Force-killed process");
        Ok(KillResult::Terminated { forced: true })
    }
}

fn is_older_than(path: &Path, now: SystemTime, max_age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

async fn wait_for_exit(pid: u32, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        time::sleep(EXIT_POLL).await;
    }
}
