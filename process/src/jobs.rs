//! Jobs shipped with the `fibril` binary.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobContext, JobRegistry};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Write (or append) text to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: PathBuf,
    pub contents: String,
    #[serde(default)]
    pub append: bool,
}

impl Job for WriteFile {
    const NAME: &'static str = "write-file";

    fn run(self, ctx: &JobContext) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(self.contents.as_bytes())
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        ctx.touch();
        tracing::info!(path = %self.path.display(), bytes = self.contents.len(), "Wrote file");
        Ok(())
    }
}

/// Sleep for `millis`. With `heartbeat`, the idle deadline is refreshed while sleeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
    #[serde(default)]
    pub heartbeat: bool,
}

impl Job for Sleep {
    const NAME: &'static str = "sleep";

    fn run(self, ctx: &JobContext) -> anyhow::Result<()> {
        let total = Duration::from_millis(self.millis);
        while ctx.elapsed() < total {
            thread::sleep(SLEEP_SLICE.min(total.saturating_sub(ctx.elapsed())));
            if self.heartbeat {
                ctx.touch();
            }
        }
        Ok(())
    }
}

/// Run a program with array-form arguments and wait for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Job for RunCommand {
    const NAME: &'static str = "command";

    fn run(self, ctx: &JobContext) -> anyhow::Result<()> {
        ctx.touch();
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .with_context(|| format!("failed to start {}", self.program))?;
        ctx.touch();
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }
}

/// Register every built-in job.
pub fn register_builtin(registry: &mut JobRegistry) {
    registry
        .register::<WriteFile>()
        .register::<Sleep>()
        .register::<RunCommand>();
}
