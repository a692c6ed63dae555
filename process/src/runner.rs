//! Child-side execution of a payload file (`execute-payload`).
//!
//! Order matters: containment is checked before anything is read, the payload is
//! deleted as soon as it has been read (so a refused payload is never retried), and
//! the child's own PID record is removed on every exit path.

use std::any::Any;
use std::env;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time;

use fibril_config::{FibrilConfig, SecretKey};
use fibril_types::Pid;
use fibril_utils::remove_if_exists;

use crate::crypto::{self, IntegrityError};
use crate::job::{Envelope, Handler, JobContext, JobRegistry};
use crate::state::{PayloadStore, StateDirs};

pub const TIMEOUT_ENV: &str = "FIBRIL_TIMEOUT_MS";
pub const IDLE_TIMEOUT_ENV: &str = "FIBRIL_IDLE_TIMEOUT_MS";

/// Exit status used when a deadline elapses, matching coreutils `timeout`.
pub const DEADLINE_EXIT_CODE: i32 = 124;

const MAX_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    WallClock,
    Idle,
}

impl DeadlineKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WallClock => "timeout",
            Self::Idle => "idle timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("failed to read payload {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse payload {}: {source}", path.display())]
    Parse { path: PathBuf, source: io::Error },
    #[error("secret key is not configured; cannot verify payload")]
    MissingSecret,
    #[error("invalid job envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("job {job} failed: {source:#}")]
    Job { job: String, source: anyhow::Error },
    #[error("job {job} exceeded its {} of {ms}ms", kind.as_str())]
    Deadline {
        job: String,
        kind: DeadlineKind,
        ms: u64,
    },
    #[error("job {job} panicked: {message}")]
    Panicked { job: String, message: String },
}

impl ExecError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Deadline { .. } => DEADLINE_EXIT_CODE,
            _ => 1,
        }
    }
}

/// Deadlines the parent asked the child to enforce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl ExecLimits {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Zero, empty, or unparsable values mean "no limit".
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
        };
        Self {
            timeout: read(TIMEOUT_ENV),
            idle_timeout: read(IDLE_TIMEOUT_ENV),
        }
    }

    fn tick(&self) -> Option<Duration> {
        self.timeout
            .into_iter()
            .chain(self.idle_timeout)
            .min()
            .map(|shortest| shortest.min(MAX_TICK))
    }

    fn expired(&self, ctx: &JobContext) -> Option<(DeadlineKind, Duration)> {
        if let Some(limit) = self.timeout
            && ctx.elapsed() >= limit
        {
            return Some((DeadlineKind::WallClock, limit));
        }
        if let Some(limit) = self.idle_timeout
            && ctx.idle_for() >= limit
        {
            return Some((DeadlineKind::Idle, limit));
        }
        None
    }
}

enum Outcome {
    Finished(anyhow::Result<()>),
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[derive(Debug, Clone)]
pub struct Runner {
    dirs: StateDirs,
    secret: Option<SecretKey>,
    payload_ttl: Duration,
    registry: JobRegistry,
    limits: ExecLimits,
}

impl Runner {
    #[must_use]
    pub fn new(
        dirs: StateDirs,
        secret: Option<SecretKey>,
        payload_ttl: Duration,
        registry: JobRegistry,
    ) -> Self {
        Self {
            dirs,
            secret,
            payload_ttl,
            registry,
            limits: ExecLimits::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &FibrilConfig, registry: JobRegistry) -> Self {
        Self::new(
            StateDirs::from_config(&config.process),
            config.secret().cloned(),
            config.process.payload_ttl(),
            registry,
        )
    }

    pub fn with_limits(mut self, limits: ExecLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Verify and run the payload at `path`.
    pub async fn execute(&self, path: &Path) -> Result<(), ExecError> {
        let result = self.execute_inner(path).await;
        self.forget_self();
        match &result {
            Ok(()) => tracing::info!(path = %path.display(), "Payload executed"),
            Err(e) => tracing::error!(path = %path.display(), "Payload failed: {e}"),
        }
        result
    }

    async fn execute_inner(&self, path: &Path) -> Result<(), ExecError> {
        let payloads = self.dirs.payloads();
        if !payloads.contains(path) {
            return Err(IntegrityError::OutsidePayloadDir.into());
        }

        let read = PayloadStore::read(path);
        if let Err(e) = remove_if_exists(path) {
            tracing::warn!(path = %path.display(), "Failed to remove payload: {e}");
        }
        let payload = read.map_err(|source| {
            if source.kind() == io::ErrorKind::InvalidData {
                ExecError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            } else {
                ExecError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let ttl_secs = self.payload_ttl.as_secs();
        let age_secs = Utc::now().timestamp() - payload.timestamp;
        if ttl_secs > 0 && age_secs > i64::try_from(ttl_secs).unwrap_or(i64::MAX) {
            return Err(IntegrityError::Expired { age_secs, ttl_secs }.into());
        }

        let secret = self
            .secret
            .as_ref()
            .filter(|secret| !secret.is_empty())
            .ok_or(ExecError::MissingSecret)?;
        let blob = crypto::open(&payload, secret.as_bytes())?;
        let envelope = Envelope::from_blob(&blob).map_err(ExecError::Envelope)?;
        let handler = self
            .registry
            .handler(&envelope.job)
            .ok_or_else(|| ExecError::UnknownJob(envelope.job.clone()))?;

        tracing::debug!(
            job = %envelope.job,
            label = payload.label.as_deref().unwrap_or(""),
            "Running job"
        );
        let ctx = JobContext::new(payload.label);
        self.supervise(envelope.job, handler, envelope.args, ctx)
            .await
    }

    /// Run the job on its own thread and watch its deadlines.
    ///
    /// A job that overruns is abandoned, not stopped: the thread keeps running until
    /// the process exits.
    async fn supervise(
        &self,
        job: String,
        handler: Handler,
        args: Value,
        ctx: JobContext,
    ) -> Result<(), ExecError> {
        let (tx, mut rx) = oneshot::channel();
        let worker_ctx = ctx.clone();
        thread::Builder::new()
            .name(format!("fibril-job-{job}"))
            .spawn(move || {
                let outcome =
                    match panic::catch_unwind(AssertUnwindSafe(|| handler(args, &worker_ctx))) {
                        Ok(result) => Outcome::Finished(result),
                        Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
                    };
                let _ = tx.send(outcome);
            })
            .map_err(|e| ExecError::Job {
                job: job.clone(),
                source: e.into(),
            })?;

        let received = match self.limits.tick() {
            None => rx.await,
            Some(tick) => loop {
                if let Ok(received) = time::timeout(tick, &mut rx).await {
                    break received;
                }
                if let Some((kind, limit)) = self.limits.expired(&ctx) {
                    return Err(ExecError::Deadline {
                        job,
                        kind,
                        ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
        };

        match received {
            Ok(Outcome::Finished(Ok(()))) => Ok(()),
            Ok(Outcome::Finished(Err(source))) => Err(ExecError::Job { job, source }),
            Ok(Outcome::Panicked(message)) => Err(ExecError::Panicked { job, message }),
            Err(_) => Err(ExecError::Panicked {
                job,
                message: "worker exited without reporting".to_string(),
            }),
        }
    }

    fn forget_self(&self) {
        let Ok(pid) = Pid::new(process::id()) else {
            return;
        };
        if let Err(e) = self.dirs.pids().remove(pid) {
            tracing::warn!(pid = pid.value(), "Failed to remove own PID record: {e}");
        }
    }
}

/// Load limits from the environment and run the payload at `path`.
pub async fn execute_payload(
    config: &FibrilConfig,
    registry: JobRegistry,
    path: &Path,
) -> Result<(), ExecError> {
    Runner::from_config(config, registry)
        .with_limits(ExecLimits::from_env())
        .execute(path)
        .await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use fibril_types::{CipherId, ProcessRecord};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::Job;
    use crate::jobs::{Sleep, WriteFile, register_builtin};

    const SECRET: &str = "runner-secret";

    #[derive(Serialize, Deserialize)]
    struct Explode;

    impl Job for Explode {
        const NAME: &'static str = "explode";

        fn run(self, _ctx: &JobContext) -> anyhow::Result<()> {
            panic!("kaboom");
        }
    }

    fn runner(root: &Path) -> Runner {
        let mut registry = JobRegistry::new();
        register_builtin(&mut registry);
        registry.register::<Explode>();
        let dirs = StateDirs::new(root);
        dirs.ensure();
        Runner::new(
            dirs,
            Some(SecretKey::new(SECRET)),
            Duration::from_secs(60),
            registry,
        )
    }

    fn write_payload<J: Job>(runner: &Runner, job: &J, encrypt: bool, timestamp: i64) -> PathBuf {
        let blob = Envelope::for_job(job).unwrap().to_blob().unwrap();
        let cipher = encrypt.then_some(CipherId::Aes256Gcm);
        let payload = crypto::seal(&blob, SECRET.as_bytes(), cipher, None, timestamp).unwrap();
        runner.dirs.payloads().create(&payload).unwrap()
    }

    #[tokio::test]
    async fn runs_encrypted_job_and_consumes_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());
        let out = tmp.path().join("out.txt");
        let path = write_payload(
            &runner,
            &WriteFile {
                path: out.clone(),
                contents: "done".into(),
                append: false,
            },
            true,
            Utc::now().timestamp(),
        );

        runner.execute(&path).await.unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "done");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn refuses_paths_outside_payload_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());
        let outside = tmp.path().join("evil.json");
        fs::write(&outside, "{}").unwrap();

        let err = runner.execute(&outside).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Integrity(IntegrityError::OutsidePayloadDir)
        ));
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn tampered_payload_is_refused_and_still_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());
        let path = write_payload(
            &runner,
            &Sleep {
                millis: 1,
                heartbeat: false,
            },
            false,
            Utc::now().timestamp(),
        );
        let mut payload = PayloadStore::read(&path).unwrap();
        payload.hmac = "00".repeat(32);
        fs::write(&path, serde_json::to_vec(&payload).unwrap()).unwrap();

        let err = runner.execute(&path).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Integrity(IntegrityError::HmacMismatch)
        ));
        assert_eq!(err.exit_code(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn expired_payload_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());
        let path = write_payload(
            &runner,
            &Sleep {
                millis: 1,
                heartbeat: false,
            },
            false,
            Utc::now().timestamp() - 3_600,
        );
        let err = runner.execute(&path).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Integrity(IntegrityError::Expired { ttl_secs: 60, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_job_and_missing_secret() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runner = runner(tmp.path());
        runner.registry = JobRegistry::new();
        let path = write_payload(
            &runner,
            &Sleep {
                millis: 1,
                heartbeat: false,
            },
            false,
            Utc::now().timestamp(),
        );
        let err = runner.execute(&path).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownJob(name) if name == "sleep"));

        runner.secret = None;
        let path = write_payload(
            &runner,
            &Sleep {
                millis: 1,
                heartbeat: false,
            },
            false,
            Utc::now().timestamp(),
        );
        assert!(matches!(
            runner.execute(&path).await,
            Err(ExecError::MissingSecret)
        ));
    }

    #[tokio::test]
    async fn wall_clock_deadline_exits_124() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path()).with_limits(ExecLimits {
            timeout: Some(Duration::from_millis(50)),
            idle_timeout: None,
        });
        let path = write_payload(
            &runner,
            &Sleep {
                millis: 1_000,
                heartbeat: true,
            },
            false,
            Utc::now().timestamp(),
        );
        let err = runner.execute(&path).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Deadline {
                kind: DeadlineKind::WallClock,
                ms: 50,
                ..
            }
        ));
        assert_eq!(err.exit_code(), DEADLINE_EXIT_CODE);
    }

    #[tokio::test]
    async fn idle_deadline_spares_jobs_that_heartbeat() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path()).with_limits(ExecLimits {
            timeout: None,
            idle_timeout: Some(Duration::from_millis(150)),
        });

        let quiet = write_payload(
            &runner,
            &Sleep {
                millis: 1_000,
                heartbeat: false,
            },
            false,
            Utc::now().timestamp(),
        );
        let err = runner.execute(&quiet).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Deadline {
                kind: DeadlineKind::Idle,
                ..
            }
        ));

        let busy = write_payload(
            &runner,
            &Sleep {
                millis: 300,
                heartbeat: true,
            },
            false,
            Utc::now().timestamp(),
        );
        runner.execute(&busy).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_job_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());
        let path = write_payload(&runner, &Explode, false, Utc::now().timestamp());
        let err = runner.execute(&path).await.unwrap_err();
        assert!(matches!(err, ExecError::Panicked { ref message, .. } if message == "kaboom"));
    }

    #[tokio::test]
    async fn removes_own_pid_record() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());
        let own = Pid::new(process::id()).unwrap();
        let record = ProcessRecord {
            pid: own,
            command: Vec::new(),
            payload_path: PathBuf::from("/x.json"),
            label: None,
            created_at: Utc::now(),
            uuid: "ab".into(),
            started_at_ms: None,
        };
        runner.dirs.pids().write(&record).unwrap();

        let _ = runner.execute(&tmp.path().join("nope.json")).await;
        assert!(!runner.dirs.pids().contains(own));
    }

    #[test]
    fn limits_parse_from_lookup() {
        let limits = ExecLimits::from_lookup(|key| match key {
            TIMEOUT_ENV => Some("1500".into()),
            IDLE_TIMEOUT_ENV => Some("0".into()),
            _ => None,
        });
        assert_eq!(limits.timeout, Some(Duration::from_millis(1_500)));
        assert_eq!(limits.idle_timeout, None);
        assert_eq!(ExecLimits::from_lookup(|_| None), ExecLimits::default());
    }
}
