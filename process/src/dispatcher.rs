//! Parent-side dispatch: seal a job into a payload file and spawn a detached child.

use std::collections::BTreeMap;
use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time;

use fibril_config::{FibrilConfig, ProcessConfig, STATE_DIR_ENV, SecretKey};
use fibril_types::{Pid, ProcessRecord, ThrottleMode, UnsupportedCipher};
#[cfg(unix)]
use fibril_utils::detach_session;
use fibril_utils::{process_started_at_unix_ms, remove_if_exists};

use crate::crypto::{self, SealError};
use crate::job::{Envelope, Job};
use crate::runner::{IDLE_TIMEOUT_ENV, TIMEOUT_ENV};
use crate::state::{PayloadStore, PidStore, StateDirs};

/// Subcommand the child binary runs.
pub const EXECUTE_SUBCOMMAND: &str = "execute-payload";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid interpreter path: {}", .0.display())]
    InvalidInterpreter(PathBuf),
    #[error("entry point not found at: {}", .0.display())]
    MissingEntryPoint(PathBuf),
    #[error("secret key is not configured; cannot sign payload")]
    MissingSecret,
    #[error(transparent)]
    UnsupportedCipher(#[from] UnsupportedCipher),
    #[error("throttled by max_concurrency ({running}/{limit} tracked)")]
    Throttled { running: usize, limit: usize },
    #[error("throttled by max_concurrency (wait timeout after {waited_ms}ms, {running}/{limit} tracked)")]
    ThrottleTimeout {
        running: usize,
        limit: usize,
        waited_ms: u64,
    },
    #[error("failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to seal payload: {0}")]
    Seal(#[from] SealError),
    #[error("failed to write payload under {}: {source}", dir.display())]
    WritePayload { dir: PathBuf, source: io::Error },
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn { program: PathBuf, source: io::Error },
    #[error("spawned pid {pid} but failed to write its tracking record: {source}")]
    Track { pid: Pid, source: io::Error },
}

/// Per-dispatch options.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Wall-clock limit enforced by the child.
    pub timeout: Option<Duration>,
    /// Limit on time without progress, enforced by the child.
    pub idle_timeout: Option<Duration>,
    pub label: Option<String>,
    /// Discard child output instead of appending it to the payload's `.log` file.
    pub output_disabled: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
            idle_timeout: None,
            label: None,
            output_disabled: true,
        }
    }
}

impl DispatchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn capture_output(mut self) -> Self {
        self.output_disabled = false;
        self
    }
}

/// Resolved program and leading arguments for the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub interpreter: PathBuf,
    pub entry_point: Option<PathBuf>,
}

impl Launcher {
    fn command_vector(&self, payload: &Path) -> Vec<String> {
        let mut argv = vec![self.interpreter.to_string_lossy().into_owned()];
        if let Some(entry) = &self.entry_point {
            argv.push(entry.to_string_lossy().into_owned());
        }
        argv.push(EXECUTE_SUBCOMMAND.to_string());
        argv.push(payload.to_string_lossy().into_owned());
        argv
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    process: ProcessConfig,
    secret: Option<SecretKey>,
    dirs: StateDirs,
}

impl Dispatcher {
    #[must_use]
    pub fn new(process: ProcessConfig, secret: Option<SecretKey>) -> Self {
        let dirs = StateDirs::from_config(&process);
        Self {
            process,
            secret,
            dirs,
        }
    }

    #[must_use]
    pub fn from_config(config: &FibrilConfig) -> Self {
        Self::new(config.process.clone(), config.secret().cloned())
    }

    #[must_use]
    pub fn state_dirs(&self) -> &StateDirs {
        &self.dirs
    }

    /// Resolve the interpreter and entry point, failing if either is unusable.
    pub fn validate(&self) -> Result<Launcher, DispatchError> {
        let interpreter = match &self.process.interpreter_path {
            Some(path) => path.clone(),
            None => env::current_exe()
                .map_err(|_| DispatchError::InvalidInterpreter(PathBuf::new()))?,
        };
        if interpreter.as_os_str().is_empty() || !interpreter.is_file() {
            return Err(DispatchError::InvalidInterpreter(interpreter));
        }
        if let Some(entry) = &self.process.entry_point
            && !entry.exists()
        {
            return Err(DispatchError::MissingEntryPoint(entry.clone()));
        }
        Ok(Launcher {
            interpreter,
            entry_point: self.process.entry_point.clone(),
        })
    }

    /// Seal `job` into a payload and spawn a child to run it.
    ///
    /// Returns the child's PID, or `None` if the OS did not report one.
    pub async fn dispatch<J: Job>(
        &self,
        job: &J,
        options: DispatchOptions,
    ) -> Result<Option<Pid>, DispatchError> {
        let launcher = self.validate()?;
        self.dirs.ensure();
        let pids = self.dirs.pids();
        self.admit(&pids).await?;

        let blob = Envelope::for_job(job)?.to_blob()?;
        let secret = self
            .secret
            .as_ref()
            .filter(|secret| !secret.is_empty())
            .ok_or(DispatchError::MissingSecret)?;
        let cipher = if self.process.encryption_enabled {
            Some(self.process.cipher()?)
        } else {
            None
        };
        let payload = crypto::seal(
            &blob,
            secret.as_bytes(),
            cipher,
            options.label.clone(),
            Utc::now().timestamp(),
        )?;

        let payloads = self.dirs.payloads();
        let payload_path = payloads
            .create(&payload)
            .map_err(|source| DispatchError::WritePayload {
                dir: payloads.dir().to_path_buf(),
                source,
            })?;

        let argv = launcher.command_vector(&payload_path);
        let child = match self.spawn(&launcher, &argv, &payload_path, &options) {
            Ok(child) => child,
            Err(source) => {
                if let Err(e) = remove_if_exists(&payload_path) {
                    tracing::warn!(path = %payload_path.display(), "Failed to remove unused payload: {e}");
                }
                return Err(DispatchError::Spawn {
                    program: launcher.interpreter,
                    source,
                });
            }
        };

        let Some(pid) = child.id().and_then(|raw| Pid::new(raw).ok()) else {
            tracing::warn!(path = %payload_path.display(), "Spawned child reported no pid");
            return Ok(None);
        };

        let uuid = hex::encode(rand::random::<[u8; 8]>());
        let record = ProcessRecord {
            pid,
            command: argv,
            payload_path: payload_path.clone(),
            label: options.label.clone(),
            created_at: Utc::now(),
            uuid: uuid.clone(),
            started_at_ms: process_started_at_unix_ms(pid.value()),
        };
        pids.write(&record)
            .map_err(|source| DispatchError::Track { pid, source })?;
        release_on_exit(child, pids, pid, uuid);

        tracing::info!(
            pid = pid.value(),
            label = options.label.as_deref().unwrap_or(""),
            payload = %payload_path.display(),
            encrypted = payload.encrypted,
            "Dispatched job {}",
            J::NAME
        );
        Ok(Some(pid))
    }

    fn spawn(
        &self,
        launcher: &Launcher,
        argv: &[String],
        payload_path: &Path,
        options: &DispatchOptions,
    ) -> io::Result<Child> {
        let mut cmd = Command::new(&launcher.interpreter);
        cmd.args(&argv[1..])
            .env(STATE_DIR_ENV, self.dirs.root())
            .stdin(Stdio::null());
        if let Some(timeout) = options.timeout {
            cmd.env(TIMEOUT_ENV, timeout.as_millis().to_string());
        }
        if let Some(idle) = options.idle_timeout {
            cmd.env(IDLE_TIMEOUT_ENV, idle.as_millis().to_string());
        }
        cmd.envs(&options.env);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        if options.output_disabled {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(PayloadStore::log_path_for(payload_path))?;
            let log_err = log.try_clone()?;
            cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        }

        #[cfg(unix)]
        detach_session(&mut cmd);

        cmd.spawn()
    }

    /// Block admission while the PID directory is at or over `max_concurrency`.
    ///
    /// Counts tracking files without a lock, so concurrent dispatchers may overshoot.
    async fn admit(&self, pids: &PidStore) -> Result<(), DispatchError> {
        let limit = self.process.max_concurrency;
        if limit == 0 {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            let running = pids.count();
            if running < limit {
                return Ok(());
            }
            match self.process.throttle_mode {
                ThrottleMode::Reject => {
                    return Err(DispatchError::Throttled { running, limit });
                }
                ThrottleMode::Wait => {
                    let waited = started.elapsed();
                    if waited > self.process.throttle_wait_max() {
                        return Err(DispatchError::ThrottleTimeout {
                            running,
                            limit,
                            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    tracing::debug!(running, limit, "Waiting for a dispatch slot");
                    time::sleep(self.process.throttle_wait_interval()).await;
                }
            }
        }
    }
}

/// Drop the tracking record once `child` has exited.
///
/// A child that finishes before its record is written finds nothing to remove, so
/// the parent settles the record itself: immediately if the child is already gone,
/// otherwise from a task that reaps it. Only the record carrying `uuid` is removed.
fn release_on_exit(mut child: Child, pids: PidStore, pid: Pid, uuid: String) {
    match child.try_wait() {
        Ok(Some(_)) => forget_record(&pids, pid, &uuid),
        Ok(None) => {
            tokio::spawn(async move {
                if child.wait().await.is_ok() {
                    forget_record(&pids, pid, &uuid);
                }
            });
        }
        Err(e) => tracing::debug!(pid = pid.value(), "Failed to poll spawned child: {e}"),
    }
}

fn forget_record(pids: &PidStore, pid: Pid, uuid: &str) {
    let Ok(record) = pids.read(pid) else {
        return;
    };
    if record.uuid != uuid {
        return;
    }
    match pids.remove(pid) {
        Ok(true) => tracing::debug!(pid = pid.value(), "Removed record of exited child"),
        Ok(false) => {}
        Err(e) => tracing::warn!(pid = pid.value(), "Failed to remove record of exited child: {e}"),
    }
}
