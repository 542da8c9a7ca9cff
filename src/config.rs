//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::AgentKind;
use crate::rpc::codec::MAX_LINE_BYTES;
use crate::rpc::peer::DEFAULT_OUTBOUND_QUEUE;
use crate::{AppError, Result};

/// What to do with a `query` for a session that is already running.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Answer with a `queryError`; the running query is unaffected.
    #[default]
    Reject,
    /// Run the query after the current one ends.
    Queue,
}

/// Configurable timeout values (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Reverse request timeout; 0 means wait indefinitely.
    #[serde(default = "default_reverse_request_seconds")]
    pub reverse_request_seconds: u64,
    /// Delay between SIGTERM and a hard kill of a cancelled agent process.
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reverse_request_seconds: default_reverse_request_seconds(),
            cancel_grace_seconds: default_cancel_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Reverse request deadline, `None` when disabled.
    #[must_use]
    pub fn reverse_request(&self) -> Option<Duration> {
        (self.reverse_request_seconds > 0).then(|| Duration::from_secs(self.reverse_request_seconds))
    }

    /// Grace period before a cancelled agent process is killed.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }
}

fn default_reverse_request_seconds() -> u64 {
    120
}

fn default_cancel_grace_seconds() -> u64 {
    3
}

/// How to launch one agent CLI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Executable name or path.
    pub cli: String,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable names passed through in addition to the base
    /// allowlist.
    #[serde(default)]
    pub inherit_env: Vec<String>,
}

impl RuntimeConfig {
    fn named(cli: &str) -> Self {
        Self {
            cli: cli.to_owned(),
            args: Vec::new(),
            inherit_env: Vec::new(),
        }
    }
}

/// Per-agent runtime settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimesConfig {
    /// Claude Code CLI.
    #[serde(default = "default_claude")]
    pub claude: RuntimeConfig,
    /// Codex CLI.
    #[serde(default = "default_codex")]
    pub codex: RuntimeConfig,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            claude: default_claude(),
            codex: default_codex(),
        }
    }
}

impl RuntimesConfig {
    /// Settings for `kind`.
    #[must_use]
    pub fn get(&self, kind: AgentKind) -> &RuntimeConfig {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Codex => &self.codex,
        }
    }
}

fn default_claude() -> RuntimeConfig {
    RuntimeConfig::named("claude")
}

fn default_codex() -> RuntimeConfig {
    RuntimeConfig::named("codex")
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

fn default_outbound_queue() -> usize {
    DEFAULT_OUTBOUND_QUEUE
}

/// Global configuration parsed from the optional TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Socket path (or `\\.\pipe\` name on Windows); generated when absent.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Handling of queries for a running session.
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    /// Longest accepted frame, in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Capacity of each connection's outbound frame queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Agent CLIs.
    #[serde(default)]
    pub runtimes: RuntimesConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            busy_policy: BusyPolicy::default(),
            max_line_bytes: default_max_line_bytes(),
            outbound_queue: default_outbound_queue(),
            timeouts: TimeoutConfig::default(),
            runtimes: RuntimesConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_line_bytes == 0 {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.outbound_queue == 0 {
            return Err(AppError::Config(
                "outbound_queue must be greater than zero".into(),
            ));
        }

        for kind in AgentKind::ALL {
            if self.runtimes.get(kind).cli.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "runtimes.{kind}.cli must not be empty"
                )));
            }
        }

        if matches!(&self.socket_path, Some(path) if path.as_os_str().is_empty()) {
            return Err(AppError::Config("socket_path must not be empty".into()));
        }

        Ok(())
    }
}
