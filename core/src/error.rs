//! Error values carried by rejected and cancelled promises.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Where the executor observed a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStage {
    Before,
    After,
}

impl CancelStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl fmt::Display for CancelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome error of a promise.
///
/// Cloneable so a settled promise can hand out the same error on every `run()`.
#[derive(Debug, Clone, Error)]
pub enum AsyncError {
    #[error("promise timed out after {ms}ms")]
    Timeout { ms: u64 },
    #[error("promise was cancelled")]
    Cancelled,
    #[error("operation cancelled {stage} execution")]
    CancelledAt { stage: CancelStage },
    /// Raised by `Async::checkpoint` from inside a unit of work.
    #[error("{0}")]
    Checkpoint(String),
    #[error("timed out after {ms}ms waiting for condition")]
    ConditionTimeout { ms: u64 },
    #[error("all promises were rejected")]
    AllRejected(Vec<AsyncError>),
    #[error("no promises to wait on")]
    Empty,
    #[error("promise was driven from inside its own unit of work")]
    Reentrant,
    #[error("unit of work panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl AsyncError {
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    /// True for every flavour of cooperative cancellation, including timeouts.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::CancelledAt { .. } | Self::Checkpoint(_) | Self::Timeout { .. }
        )
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConditionTimeout { .. })
    }

    /// The wrapped error when this is a failure of the unit of work itself.
    #[must_use]
    pub fn as_failure(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AsyncError {
    fn from(err: anyhow::Error) -> Self {
        // Keep structured errors structured when they round-trip through anyhow.
        match err.downcast::<AsyncError>() {
            Ok(inner) => inner,
            Err(err) => Self::Failed(Arc::new(err)),
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
