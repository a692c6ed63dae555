//! Shared infrastructure utilities for fibril.
//!
//! This crate provides cross-cutting utilities that the dispatcher, the child-side
//! runner, and the reaper all need but that don't belong in the IO-free
//! `fibril-types` crate:
//!
//! - **`atomic_write`**: Crash-safe, owner-only state files (temp + rename)
//! - **`process`**: Liveness probing, start-time fingerprints, termination

pub mod atomic_write;
pub mod process;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_new,
    atomic_write_with_options, ensure_dir, remove_if_exists,
};
pub use process::{
    KillOutcome, Signal, is_process_alive, probe_liveness, process_started_at_unix_ms, terminate,
};
#[cfg(unix)]
pub use process::detach_session;
