//! PID-tracking records and process lifecycle vocabulary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Pid;

pub const PID_FILE_EXTENSION: &str = "pid";

/// Metadata persisted as `{pid}.pid` when a child is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: Pid,
    /// Exact argument vector the child was spawned with.
    #[serde(rename = "cmd")]
    pub command: Vec<String>,
    #[serde(rename = "payload")]
    pub payload_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Random hex correlation id.
    pub uuid: String,
    /// Process start time (Unix epoch ms) captured at spawn, used to detect PID reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
}

impl ProcessRecord {
    #[must_use]
    pub fn file_name(&self) -> String {
        self.pid.record_file_name()
    }

    /// Extract the PID encoded in a tracking file name such as `/x/pids/123.pid`.
    #[must_use]
    pub fn pid_from_path(path: &Path) -> Option<Pid> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(PID_FILE_EXTENSION) {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }
}

/// Result of probing a tracked PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// A process holds the PID, but its start time differs from the one recorded at
    /// spawn: the original child is gone and the PID was reassigned.
    PidReused,
}

impl Liveness {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::PidReused => "pid-reused",
        }
    }

    /// Whether the tracking record still describes a running child.
    #[must_use]
    pub const fn is_tracked_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission behavior when `max_concurrency` is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// Fail the dispatch immediately.
    #[default]
    Reject,
    /// Poll until a slot frees up or the wait budget is exhausted.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown throttle mode: {0} (expected \"reject\" or \"wait\")")]
pub struct UnknownThrottleMode(pub String);

impl ThrottleMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Wait => "wait",
        }
    }
}

impl FromStr for ThrottleMode {
    type Err = UnknownThrottleMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "wait" => Ok(Self::Wait),
            other => Err(UnknownThrottleMode(other.to_string())),
        }
    }
}
