use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Operating-system process identifier of a dispatched child.
///
/// Zero is rejected: `kill(0, ..)` addresses the caller's whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Pid(u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid PID: {0}")]
pub struct InvalidPid(pub String);

impl Pid {
    pub fn new(pid: u32) -> Result<Self, InvalidPid> {
        if pid == 0 || i32::try_from(pid).is_err() {
            return Err(InvalidPid(pid.to_string()));
        }
        Ok(Self(pid))
    }

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    /// File name of the tracking record for this PID (`{pid}.pid`).
    #[must_use]
    pub fn record_file_name(self) -> String {
        format!("{}.{}", self.0, crate::PID_FILE_EXTENSION)
    }
}

impl TryFrom<u32> for Pid {
    type Error = InvalidPid;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Pid> for u32 {
    fn from(value: Pid) -> Self {
        value.0
    }
}

impl FromStr for Pid {
    type Err = InvalidPid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed
            .parse::<u32>()
            .map_err(|_| InvalidPid(trimmed.to_string()))?;
        Self::new(raw)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
