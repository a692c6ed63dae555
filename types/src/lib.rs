//! Core domain types for fibril.
//!
//! This crate contains pure domain and wire types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer: the promise core, the
//! process dispatcher, the child-side runner, and the CLI.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod ids;
mod payload;
mod process;

pub use ids::{InvalidPid, Pid};
pub use payload::{CipherId, Payload, UnsupportedCipher};
pub use process::{Liveness, PID_FILE_EXTENSION, ProcessRecord, ThrottleMode, UnknownThrottleMode};

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Promise State
// ============================================================================

/// Lifecycle state of a promise.
///
/// `Pending` is the only non-terminal state. Transitions are one-way: once a promise
/// leaves `Pending` it never changes state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    #[default]
    Pending,
    Fulfilled,
    Rejected,
    Cancelled,
}

impl PromiseState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
