//! Engine configuration.
//!
//! Everything has a default. A JSON file can override any subset, and
//! `SCRIPTPAD_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compile::CompilerConfig;
use crate::error::{Error, Result};
use crate::paths::EngineDirs;

/// Which execution strategy runs scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// Load modules into a disposable arena inside this process.
    #[default]
    InProcess,
    /// Run modules in a subordinate `scriptpad-host` process.
    OutOfProcess,
}

impl std::str::FromStr for HostKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "in_process" => Ok(HostKind::InProcess),
            "out_of_process" => Ok(HostKind::OutOfProcess),
            other => Err(format!("unknown host kind: {}", other)),
        }
    }
}

/// Execution host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub kind: HostKind,

    /// How long a cancelled script may keep running before a hard stop.
    pub cancel_grace_period_ms: u64,

    /// How long a new script host may take to report ready.
    pub startup_timeout_ms: u64,

    /// Start a fresh script host for every run.
    pub restart_host_on_every_run: bool,

    /// Explicit path to the `scriptpad-host` binary.
    pub host_binary: Option<PathBuf>,

    /// Number of pre-started script hosts kept warm by a session.
    pub pool_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kind: HostKind::default(),
            cancel_grace_period_ms: 2_000,
            startup_timeout_ms: 10_000,
            restart_host_on_every_run: false,
            host_binary: None,
            pool_size: 0,
        }
    }
}

impl HostConfig {
    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Output pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Events buffered per subscriber before writers start waiting.
    pub subscriber_capacity: usize,

    /// How long a write waits on a full subscriber before dropping the event.
    pub send_timeout_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1024,
            send_timeout_ms: 250,
        }
    }
}

impl OutputConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compiler: CompilerConfig,
    pub host: HostConfig,
    pub output: OutputConfig,
}

impl EngineConfig {
    /// Defaults with build artifacts under `dirs`.
    pub fn for_dirs(dirs: &EngineDirs) -> Self {
        let mut config = Self::default();
        config.compiler.build_dir = dirs.build_dir.clone();
        config
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Serialization(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Apply `SCRIPTPAD_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidOperation(format!("invalid value for {}: {}", key, value)))
        }

        if let Some(value) = var("SCRIPTPAD_BUILD_DIR") {
            self.compiler.build_dir = PathBuf::from(value);
        }
        if let Some(value) = var("SCRIPTPAD_HOST_KIND") {
            self.host.kind = value.parse().map_err(Error::InvalidOperation)?;
        }
        if let Some(value) = var("SCRIPTPAD_CANCEL_GRACE_MS") {
            self.host.cancel_grace_period_ms = parse("SCRIPTPAD_CANCEL_GRACE_MS", value)?;
        }
        if let Some(value) = var("SCRIPTPAD_RESTART_EVERY_RUN") {
            self.host.restart_host_on_every_run = parse("SCRIPTPAD_RESTART_EVERY_RUN", value)?;
        }
        if let Some(value) = var("SCRIPTPAD_HOST_PATH") {
            self.host.host_binary = Some(PathBuf::from(value));
        }
        if let Some(value) = var("SCRIPTPAD_SEND_TIMEOUT_MS") {
            self.output.send_timeout_ms = parse("SCRIPTPAD_SEND_TIMEOUT_MS", value)?;
        }
        Ok(self)
    }
}
