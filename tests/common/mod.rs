//! Shared test utilities and fixtures
//!
//! Each [`TestEnv`] owns a temporary state directory and a config file pointing at
//! it, so spawned `fibril` children and the in-process dispatcher agree on where
//! payloads and PID records live.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use fibril_config::{CONFIG_ENV, FibrilConfig, ProcessConfig, SecretKey};
use fibril_process::{DispatchOptions, Dispatcher, Reaper, StateDirs};

pub const SECRET: &str = "integration-secret";

/// Path of the `fibril` binary under test.
pub fn fibril_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fibril"))
}

pub struct TestEnv {
    dir: TempDir,
    encrypted: bool,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_encryption(false)
    }

    pub fn with_encryption(encrypted: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Self { dir, encrypted };
        fs::write(env.config_path(), env.config_toml()).expect("write config");
        env
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join("state")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join("config.toml")
    }

    fn config_toml(&self) -> String {
        format!(
            "secret_key = \"{SECRET}\"\n\n[process]\nstate_dir = \"{}\"\nencryption_enabled = {}\nkill_grace_ms = 300\n",
            self.state_dir().display(),
            self.encrypted
        )
    }

    pub fn config(&self) -> FibrilConfig {
        FibrilConfig::load_from(&self.config_path()).expect("load test config")
    }

    pub fn process_config(&self) -> ProcessConfig {
        let mut process = self.config().process;
        process.interpreter_path = Some(fibril_bin());
        process
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_with(self.process_config())
    }

    pub fn dispatcher_with(&self, process: ProcessConfig) -> Dispatcher {
        Dispatcher::new(process, Some(SecretKey::new(SECRET)))
    }

    /// Options that let the child find this environment's config.
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions::new().env(CONFIG_ENV, self.config_path().display().to_string())
    }

    pub fn dirs(&self) -> StateDirs {
        StateDirs::new(self.state_dir())
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::from_config(&self.config())
    }

    /// Run the `fibril` binary against this environment.
    pub fn fibril(&self, args: &[&str]) -> Output {
        self.fibril_command(args).output().expect("run fibril")
    }

    pub fn fibril_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(fibril_bin());
        cmd.args(args)
            .env(CONFIG_ENV, self.config_path())
            .env_remove("FIBRIL_SECRET_KEY")
            .env_remove("FIBRIL_STATE_DIR")
            .env("RUST_LOG", "warn");
        cmd
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
