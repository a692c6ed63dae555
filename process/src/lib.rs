//! Out-of-process job dispatch for fibril.
//!
//! The parent side ([`Dispatcher`]) seals a [`Job`] into a signed, optionally
//! encrypted payload file and spawns a detached child that runs `execute-payload`.
//! The child side ([`Runner`]) verifies and runs it. [`Reaper`] lists, cleans, and
//! kills tracked children through their PID records.

pub mod crypto;
pub mod dispatcher;
pub mod job;
pub mod jobs;
pub mod reaper;
pub mod runner;
pub mod state;
mod task;

pub use crypto::{IntegrityError, SealError};
pub use dispatcher::{DispatchError, DispatchOptions, Dispatcher, EXECUTE_SUBCOMMAND, Launcher};
pub use job::{Envelope, Job, JobContext, JobRegistry};
pub use jobs::register_builtin;
pub use reaper::{KillResult, ProcessEntry, Reaper, ReaperError};
pub use runner::{
    DEADLINE_EXIT_CODE, DeadlineKind, ExecError, ExecLimits, Runner, execute_payload,
};
pub use state::{PayloadStore, PidStore, StateDirs};
pub use task::ProcessTask;
