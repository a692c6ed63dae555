//! OS process probing and termination for dispatched children.

#[cfg(target_os = "linux")]
use std::fs;
use std::io;

use fibril_types::Liveness;

/// Start-time drift tolerated when comparing fingerprints. Linux derives start times
/// from clock ticks plus a second-resolution boot time.
const START_TIME_TOLERANCE_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Signalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM on Unix; there is no graceful equivalent on Windows.
    Graceful,
    /// SIGKILL on Unix, `TerminateProcess` on Windows.
    Forced,
}

/// Check whether `pid` refers to a running process.
///
/// On Unix this is the `kill(pid, 0)` probe. EPERM means the process exists but
/// belongs to someone else, which still counts as alive.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs an existence check without delivering a signal.
        let rc = unsafe { libc::kill(raw, 0) };
        let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        // An exited child that nobody reaped yet still answers the probe.
        #[cfg(target_os = "linux")]
        if exists && linux_is_zombie(pid) {
            return false;
        }
        exists
    }

    #[cfg(windows)]
    {
        windows_is_process_alive(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        true
    }
}

/// Classify a tracked PID, using the recorded start-time fingerprint when present.
///
/// Without a fingerprint the probe cannot tell our child apart from an unrelated
/// process that later received the same PID.
#[must_use]
pub fn probe_liveness(pid: u32, recorded_start_ms: Option<i64>) -> Liveness {
    if !is_process_alive(pid) {
        return Liveness::Dead;
    }
    match (recorded_start_ms, process_started_at_unix_ms(pid)) {
        (Some(recorded), Some(current)) if (recorded - current).abs() > START_TIME_TOLERANCE_MS => {
            Liveness::PidReused
        }
        _ => Liveness::Alive,
    }
}

/// Best-effort lookup of a process start timestamp (Unix epoch milliseconds).
///
/// Returns `None` on unsupported platforms or when the process cannot be inspected
/// (permissions, process already exited, etc.).
#[must_use]
pub fn process_started_at_unix_ms(pid: u32) -> Option<i64> {
    #[cfg(target_os = "linux")]
    {
        linux_process_started_at_unix_ms(pid)
    }
    #[cfg(windows)]
    {
        windows_process_started_at_unix_ms(pid)
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = pid;
        None
    }
}

/// Send a termination signal to `pid`'s process group, falling back to the pid itself.
///
/// Dispatched children start their own session, so pid == process group id.
pub fn terminate(pid: u32, signal: Signal) -> io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
        let sig = match signal {
            Signal::Graceful => libc::SIGTERM,
            Signal::Forced => libc::SIGKILL,
        };
        // SAFETY: raw is a positive pid; killpg/kill only deliver a signal.
        unsafe {
            if libc::killpg(raw, sig) == 0 {
                return Ok(KillOutcome::Signalled);
            }
            if libc::kill(raw, sig) == 0 {
                return Ok(KillOutcome::Signalled);
            }
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(KillOutcome::NotRunning);
        }
        Err(err)
    }

    #[cfg(windows)]
    {
        let _ = signal;
        windows_terminate_process(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (pid, signal);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process termination is not supported on this platform",
        ))
    }
}

/// Put the child in its own session so it outlives the dispatcher and can be
/// terminated as a group.
#[cfg(unix)]
pub fn detach_session(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe and runs between fork and exec.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(target_os = "linux")]
fn linux_process_started_at_unix_ms(pid: u32) -> Option<i64> {
    use std::fs;

    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let start_ticks = parse_linux_proc_stat_starttime_ticks(&stat)?;

    let btime_secs = linux_boot_time_epoch_secs()?;
    // SAFETY: sysconf has no memory-safety preconditions.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        return None;
    }
    let hz = hz as u64;

    let start_ms = start_ticks.saturating_mul(1000) / hz;
    let unix_ms = btime_secs.saturating_mul(1000).saturating_add(start_ms);
    i64::try_from(unix_ms).ok()
}

#[cfg(target_os = "linux")]
fn linux_boot_time_epoch_secs() -> Option<u64> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    stat.lines()
        .find_map(|line| line.trim().strip_prefix("btime "))
        .and_then(|rest| rest.trim().parse::<u64>().ok())
}

#[cfg(target_os = "linux")]
fn linux_is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| parse_linux_proc_stat_state(&stat))
        .is_some_and(|state| matches!(state, 'Z' | 'X'))
}

#[cfg(target_os = "linux")]
fn parse_linux_proc_stat_state(proc_stat: &str) -> Option<char> {
    let close_paren = proc_stat.rfind(')')?;
    proc_stat.get(close_paren + 1..)?.trim_start().chars().next()
}

#[cfg(target_os = "linux")]
fn parse_linux_proc_stat_starttime_ticks(proc_stat: &str) -> Option<u64> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let close_paren = proc_stat.rfind(')')?;
    let after = proc_stat.get(close_paren + 1..)?.trim();
    // starttime is field #22 overall => index 19 in the remainder.
    after.split_whitespace().nth(19)?.parse::<u64>().ok()
}

#[cfg(windows)]
fn windows_is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // SAFETY: Win32 API call.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) } as HANDLE;
    if handle.is_null() {
        return false;
    }
    let mut code: u32 = 0;
    // SAFETY: handle is valid and `code` is a valid out pointer.
    let ok = unsafe { GetExitCodeProcess(handle, &mut code) };
    // SAFETY: always close handle.
    unsafe {
        CloseHandle(handle);
    }
    ok != 0 && code == STILL_ACTIVE as u32
}

#[cfg(windows)]
fn windows_process_started_at_unix_ms(pid: u32) -> Option<i64> {
    use std::mem::MaybeUninit;
    use windows_sys::Win32::Foundation::{CloseHandle, FILETIME, HANDLE};
    use windows_sys::Win32::System::Threading::{
        GetProcessTimes, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // FILETIME is 100-nanosecond intervals since 1601-01-01.
    const UNIX_EPOCH_AS_FILETIME_100NS: u64 = 116_444_736_000_000_000;

    // SAFETY: Win32 API call.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) } as HANDLE;
    if handle.is_null() {
        return None;
    }
    let mut creation = MaybeUninit::<FILETIME>::uninit();
    let mut exit = MaybeUninit::<FILETIME>::uninit();
    let mut kernel = MaybeUninit::<FILETIME>::uninit();
    let mut user = MaybeUninit::<FILETIME>::uninit();
    // SAFETY: `handle` is valid; FILETIME pointers are valid.
    let ok = unsafe {
        GetProcessTimes(
            handle,
            creation.as_mut_ptr(),
            exit.as_mut_ptr(),
            kernel.as_mut_ptr(),
            user.as_mut_ptr(),
        )
    };
    // SAFETY: always close handle.
    unsafe {
        CloseHandle(handle);
    }
    if ok == 0 {
        return None;
    }
    // SAFETY: ok != 0 implies out params initialized.
    let creation = unsafe { creation.assume_init() };
    let ft = (u64::from(creation.dwHighDateTime) << 32) | u64::from(creation.dwLowDateTime);
    let unix_ms = ft.checked_sub(UNIX_EPOCH_AS_FILETIME_100NS)? / 10_000;
    i64::try_from(unix_ms).ok()
}

#[cfg(windows)]
fn windows_terminate_process(pid: u32) -> io::Result<KillOutcome> {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE, TerminateProcess,
    };

    // SAFETY: Win32 API call.
    let handle = unsafe {
        OpenProcess(
            PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_TERMINATE,
            0,
            pid,
        )
    } as HANDLE;
    if handle.is_null() {
        return Ok(KillOutcome::NotRunning);
    }
    // SAFETY: handle is valid.
    let ok = unsafe { TerminateProcess(handle, 1) };
    let err = io::Error::last_os_error();
    // SAFETY: always close handle.
    unsafe {
        CloseHandle(handle);
    }
    if ok == 0 {
        return Err(err);
    }
    Ok(KillOutcome::Signalled)
}
