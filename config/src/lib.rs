//! Configuration for fibril.
//!
//! Read from `$FIBRIL_CONFIG` or `~/.fibril/config.toml`. A missing file yields the
//! defaults; string values may reference `${ENV_VAR}`.
//!
//! ```toml
//! secret_key = "base64:c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LTMy"
//!
//! [process]
//! encryption_enabled = true
//! max_concurrency = 4
//! throttle_mode = "wait"
//! ```

mod schedule;

pub use schedule::{
    Frequency, MaintenanceTask, ProcessCleanSchedule, ProcessOptimizeSchedule, ScheduleConfig,
};

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt, fs, io};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use thiserror::Error;

use fibril_types::{CipherId, ThrottleMode, UnsupportedCipher};

pub const CONFIG_ENV: &str = "FIBRIL_CONFIG";
pub const SECRET_KEY_ENV: &str = "FIBRIL_SECRET_KEY";
pub const STATE_DIR_ENV: &str = "FIBRIL_STATE_DIR";
pub const INTERPRETER_ENV: &str = "FIBRIL_INTERPRETER";
pub const ENTRY_POINT_ENV: &str = "FIBRIL_ENTRY_POINT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid schedule frequency for {task}: {value:?}")]
    InvalidFrequency { task: &'static str, value: String },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FibrilConfig {
    /// Process-wide secret used to sign (and derive the key that encrypts) payloads.
    pub secret_key: Option<SecretKey>,
    pub process: ProcessConfig,
    pub schedule: ScheduleConfig,
}

/// Secret key bytes. `base64:`-prefixed values are decoded.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a configured key string. Values that are not valid base64 after the
    /// `base64:` prefix are used verbatim.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let expanded = expand_env_vars(raw);
        if let Some(encoded) = expanded.strip_prefix("base64:")
            && let Ok(decoded) = STANDARD.decode(encoded.trim())
        {
            return Self(decoded);
        }
        Self(expanded.into_bytes())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretKey {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

// Manual Debug impl to prevent leaking the secret in logs.
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Binary that executes payloads. Default: the current executable.
    pub interpreter_path: Option<PathBuf>,
    /// Optional script/entry argument placed before `execute-payload`.
    pub entry_point: Option<PathBuf>,
    /// Root of the PID-tracking and payload directories. Default: `~/.fibril/state`.
    pub state_dir: Option<PathBuf>,
    pub encryption_enabled: bool,
    pub encryption_cipher: String,
    pub payload_ttl_seconds: u64,
    /// Maximum tracked children; 0 disables the throttle.
    pub max_concurrency: usize,
    pub throttle_mode: ThrottleMode,
    pub throttle_wait_max_seconds: u64,
    pub throttle_wait_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when killing a child.
    pub kill_grace_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter_path: None,
            entry_point: None,
            state_dir: None,
            encryption_enabled: false,
            encryption_cipher: CipherId::default().as_str().to_string(),
            payload_ttl_seconds: 86_400,
            max_concurrency: 0,
            throttle_mode: ThrottleMode::Reject,
            throttle_wait_max_seconds: 30,
            throttle_wait_interval_ms: 200,
            kill_grace_ms: 200,
        }
    }
}

impl ProcessConfig {
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".fibril").join("state")))
            .unwrap_or_else(|| env::temp_dir().join("fibril"))
    }

    pub fn cipher(&self) -> Result<CipherId, UnsupportedCipher> {
        self.encryption_cipher.parse()
    }

    #[must_use]
    pub fn payload_ttl(&self) -> Duration {
        Duration::from_secs(self.payload_ttl_seconds)
    }

    #[must_use]
    pub fn throttle_wait_max(&self) -> Duration {
        Duration::from_secs(self.throttle_wait_max_seconds)
    }

    #[must_use]
    pub fn throttle_wait_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_wait_interval_ms.max(1))
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl FibrilConfig {
    /// Load from `$FIBRIL_CONFIG` or the default path, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file without consulting the environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.process.interpreter_path = config.process.interpreter_path.map(expand_path);
        config.process.entry_point = config.process.entry_point.map(expand_path);
        config.process.state_dir = config.process.state_dir.map(expand_path);
        Ok(config)
    }

    /// Apply `FIBRIL_*` overrides using `lookup` (normally `std::env::var`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(secret) = non_empty(SECRET_KEY_ENV) {
            self.secret_key = Some(SecretKey::parse(&secret));
        }
        if let Some(dir) = non_empty(STATE_DIR_ENV) {
            self.process.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = non_empty(INTERPRETER_ENV) {
            self.process.interpreter_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(ENTRY_POINT_ENV) {
            self.process.entry_point = Some(PathBuf::from(path));
        }
    }

    /// The configured secret, if present and non-empty.
    #[must_use]
    pub fn secret(&self) -> Option<&SecretKey> {
        self.secret_key.as_ref().filter(|key| !key.is_empty())
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".fibril").join("config.toml"))
}

fn expand_path(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(raw) => PathBuf::from(expand_env_vars(raw)),
        None => path,
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
