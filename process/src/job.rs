//! Serializable units of work for child processes.
//!
//! Closures cannot cross a process boundary, so dispatched work is a [`Job`]: a
//! serializable value whose fields are its captured arguments. The payload carries
//! the envelope `{"job": NAME, "args": <job>}`; the child looks `NAME` up in its
//! [`JobRegistry`] and runs the deserialized job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub trait Job: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier resolved by the child's registry.
    const NAME: &'static str;

    fn run(self, ctx: &JobContext) -> anyhow::Result<()>;
}

/// Wire form of a job inside a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub job: String,
    pub args: Value,
}

impl Envelope {
    pub fn for_job<J: Job>(job: &J) -> serde_json::Result<Self> {
        Ok(Self {
            job: J::NAME.to_string(),
            args: serde_json::to_value(job)?,
        })
    }

    pub fn to_blob(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_blob(blob: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(blob)
    }
}

/// Runtime context handed to a running job.
///
/// `touch()` records progress for the idle deadline; long-running jobs that want an
/// idle timeout to apply should call it whenever they make headway.
#[derive(Debug, Clone)]
pub struct JobContext {
    label: Option<String>,
    started: Instant,
    last_touch_ms: Arc<AtomicU64>,
}

impl JobContext {
    #[must_use]
    pub fn new(label: Option<String>) -> Self {
        Self {
            label,
            started: Instant::now(),
            last_touch_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn touch(&self) {
        let now = elapsed_ms(self.started);
        self.last_touch_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last `touch()` (or since the job started).
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let now = elapsed_ms(self.started);
        let last = self.last_touch_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) type Handler = Arc<dyn Fn(Value, &JobContext) -> anyhow::Result<()> + Send + Sync>;

/// Maps job names to the code that runs them.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: BTreeMap<&'static str, Handler>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `J`, replacing any job previously registered under the same name.
    pub fn register<J: Job>(&mut self) -> &mut Self {
        let handler: Handler = Arc::new(|args: Value, ctx: &JobContext| {
            let job: J = serde_json::from_value(args)
                .with_context(|| format!("invalid arguments for job {}", J::NAME))?;
            job.run(ctx)
        });
        self.handlers.insert(J::NAME, handler);
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
