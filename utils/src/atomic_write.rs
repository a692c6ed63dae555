//! Atomic file write helpers for payload and PID-tracking files.
//!
//! Uses a temp file + rename pattern so a concurrently scanning reaper or a child
//! racing its parent never observes a half-written JSON document.

use std::fs;
#[cfg(unix)]
use std::fs::Permissions;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Allow the file to inherit the default umask.
    Default,
    /// Strictly enforce owner-only read/write permissions (0o600 on Unix).
    #[default]
    SensitiveOwnerOnly,
}

impl PersistMode {
    #[cfg(unix)]
    fn mode(self) -> Option<u32> {
        match self {
            Self::Default => None,
            Self::SensitiveOwnerOnly => Some(0o600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSyncPolicy {
    SyncAll,
    SkipSync,
}

#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    /// File sync policy for the temp file before persisting.
    pub file_sync: FileSyncPolicy,
    /// Determine the permission policy for the created file.
    pub mode: PersistMode,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            file_sync: FileSyncPolicy::SyncAll,
            // Payloads carry signed job arguments; PID records carry command lines.
            mode: PersistMode::SensitiveOwnerOnly,
        }
    }
}

/// Replace `path` atomically with `bytes`.
pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with_options(path, bytes, AtomicWriteOptions::default())
}

/// Create `path` atomically, failing with `AlreadyExists` instead of clobbering.
pub fn atomic_write_new(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = prepare_temp(path, bytes, AtomicWriteOptions::default())?;
    if let Err(err) = tmp.persist_noclobber(path) {
        return Err(err.error);
    }
    apply_final_mode(path, AtomicWriteOptions::default().mode)
}

pub fn atomic_write_with_options(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = prepare_temp(path, bytes, options)?;

    // Rename-over-existing fails on Windows; a PID file may be stale from a reused PID.
    if let Err(err) = tmp.persist(path) {
        if !path.exists() {
            return Err(err.error);
        }
        fs::remove_file(path)?;
        if let Err(retry) = err.file.persist(path) {
            return Err(retry.error);
        }
    }

    apply_final_mode(path, options.mode)
}

fn prepare_temp(path: &Path, bytes: &[u8], options: AtomicWriteOptions) -> io::Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    if let Some(mode) = options.mode.mode() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), Permissions::from_mode(mode))?;
    }

    tmp.write_all(bytes)?;
    if matches!(options.file_sync, FileSyncPolicy::SyncAll) {
        tmp.as_file().sync_all()?;
    }
    Ok(tmp)
}

#[cfg(unix)]
fn apply_final_mode(path: &Path, mode: PersistMode) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode.mode() {
        fs::set_permissions(path, Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_final_mode(_path: &Path, _mode: PersistMode) -> io::Result<()> {
    Ok(())
}

/// Create `dir` (recursively) if missing, ignoring failures.
///
/// Sibling dispatches race to create the same directories; whichever loses simply
/// finds them present. Any real problem resurfaces on the subsequent write.
pub fn ensure_dir(dir: &Path) {
    if dir.is_dir() {
        return;
    }
    if let Err(e) = fs::create_dir_all(dir) {
        debug!(path = %dir.display(), "create_dir_all failed (best-effort): {e}");
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(dir, Permissions::from_mode(0o700)) {
            debug!(path = %dir.display(), "Failed to restrict directory mode: {e}");
        }
    }
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;

    use super::{
        AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write_new,
        atomic_write_with_options, ensure_dir, remove_if_exists,
    };

    #[test]
    fn atomic_write_overwrites_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("123.pid");
        let opts = AtomicWriteOptions {
            file_sync: FileSyncPolicy::SkipSync,
            mode: PersistMode::Default,
        };

        atomic_write_with_options(&path, b"one", opts).expect("write one");
        atomic_write_with_options(&path, b"two", opts).expect("write two");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
    }

    #[test]
    fn atomic_write_new_refuses_to_clobber() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.json");

        atomic_write_new(&path, b"first").expect("first write");
        let err = atomic_write_new(&path, b"second").expect_err("second write must fail");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&path).expect("read"), "first");
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_new_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secure.json");
        atomic_write_new(&path, b"secret").expect("write");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn ensure_dir_creates_nested_and_tolerates_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("state").join("pids");
        ensure_dir(&nested);
        ensure_dir(&nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn remove_if_exists_reports_whether_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gone.pid");
        fs::write(&path, b"x").expect("write");
        assert!(remove_if_exists(&path).expect("remove"));
        assert!(!remove_if_exists(&path).expect("second remove"));
    }
}
