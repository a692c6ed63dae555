//! Keep decrypted payloads out of core dumps.
//!
//! `execute-payload` holds the plaintext job and the secret key in memory, so the
//! child disables core dumps (and, on Windows, crash-report dialogs) before it
//! opens the payload.

#[cfg(windows)]
use anyhow::bail;
use anyhow::{Context, Result};
use std::env;
#[cfg(unix)]
use std::io;

pub const ALLOW_COREDUMPS_ENV: &str = "FIBRIL_ALLOW_COREDUMPS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hardening {
    Applied,
    SkippedByOverride,
}

pub fn apply() -> Result<Hardening> {
    if override_enabled(env::var(ALLOW_COREDUMPS_ENV).ok().as_deref()) {
        tracing::warn!(
            env_var = ALLOW_COREDUMPS_ENV,
            "Core dumps left enabled for payload execution"
        );
        return Ok(Hardening::SkippedByOverride);
    }

    apply_platform_hardening().context("failed to disable core dumps")?;
    tracing::debug!("Core dumps disabled for payload execution");
    Ok(Hardening::Applied)
}

fn override_enabled(raw: Option<&str>) -> bool {
    raw.is_some_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        )
    })
}

#[cfg(unix)]
fn apply_platform_hardening() -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit only reads the struct we pass.
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const limit) } != 0 {
        return Err(io::Error::last_os_error()).context("setrlimit(RLIMIT_CORE=0) failed");
    }

    #[cfg(target_os = "linux")]
    {
        // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
        if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
            return Err(io::Error::last_os_error()).context("prctl(PR_SET_DUMPABLE=0) failed");
        }
    }

    Ok(())
}

#[cfg(windows)]
fn apply_platform_hardening() -> Result<()> {
    use windows_sys::Win32::System::Diagnostics::Debug::{
        SEM_FAILCRITICALERRORS, SEM_NOGPFAULTERRORBOX, SetErrorMode,
    };
    use windows_sys::Win32::System::ErrorReporting::{WER_FAULT_REPORTING_NO_UI, WerSetFlags};

    // SAFETY: both calls only change process-wide error reporting flags.
    unsafe {
        let _ = SetErrorMode(SEM_FAILCRITICALERRORS | SEM_NOGPFAULTERRORBOX);
        let hr = WerSetFlags(WER_FAULT_REPORTING_NO_UI);
        if hr < 0 {
            bail!("WerSetFlags failed with HRESULT 0x{:08X}", hr as u32);
        }
    }

    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn apply_platform_hardening() -> Result<()> {
    Ok(())
}
