//! Agent CLI process plumbing shared by the process-backed runtimes.
//!
//! Spawns headless agent processes with:
//! - `kill_on_drop(true)` so a dropped query never leaks a process.
//! - `env_clear()` plus an allowlist, so only the variables the agent needs
//!   (and the ones the client asked for) reach the child.
//! - stdout framed as NDJSON through [`LineReader`].
//! - stderr drained by a background task that keeps the last few lines for
//!   error reports.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::rpc::codec::LineReader;
use crate::{AppError, Result};

/// Environment variables every agent process inherits.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Variable carrying the sidecar session id into the agent process.
pub const SESSION_ID_ENV: &str = "AGENT_SIDECAR_SESSION_ID";

const STDERR_TAIL_LINES: usize = 20;

/// How to launch one agent process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable name or path.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Additional variable names copied from the sidecar's environment.
    pub inherit_env: Vec<String>,
    /// Variables set explicitly on the child.
    pub extra_env: HashMap<String, String>,
    /// Keep stdin open as a pipe; otherwise stdin is `/dev/null`.
    pub pipe_stdin: bool,
}

/// A running agent process.
#[derive(Debug)]
pub struct AgentProcess {
    session_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    /// NDJSON reader over the agent's stdout.
    pub stdout: LineReader<ChildStdout>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Spawn an agent process described by `spec`.
///
/// # Errors
///
/// Returns `AppError::Runtime` when the working directory does not exist,
/// the program cannot be started, or its stdio cannot be captured.
pub fn spawn_process(
    spec: &ProcessSpec,
    session_id: &str,
    max_line_bytes: usize,
) -> Result<AgentProcess> {
    if !spec.cwd.is_dir() {
        return Err(AppError::Runtime(format!(
            "working directory {} does not exist",
            spec.cwd.display()
        )));
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);

    cmd.env_clear();
    for key in ALLOWED_ENV_VARS
        .iter()
        .copied()
        .chain(spec.inherit_env.iter().map(String::as_str))
    {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(&spec.extra_env);
    cmd.env(SESSION_ID_ENV, session_id);

    let stdin_mode = if spec.pipe_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    cmd.current_dir(&spec.cwd)
        .stdin(stdin_mode)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Runtime(format!("failed to spawn {}: {err}", spec.program))
    })?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Runtime("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Runtime("failed to capture agent stderr".into()))?;

    info!(
        session_id,
        program = %spec.program,
        pid = ?child.id(),
        cwd = %spec.cwd.display(),
        "agent process spawned"
    );

    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    tokio::spawn(drain_stderr(
        session_id.to_owned(),
        stderr,
        Arc::clone(&stderr_tail),
    ));

    Ok(AgentProcess {
        session_id: session_id.to_owned(),
        child,
        stdin,
        stdout: LineReader::new(stdout, max_line_bytes),
        stderr_tail,
    })
}

impl AgentProcess {
    /// Write one JSON value as an NDJSON line to the agent's stdin.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` when stdin is closed or the write fails.
    pub async fn write_json(&mut self, value: &Value) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AppError::Runtime("agent stdin is closed".into()))?;

        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Runtime(format!("failed to write to agent stdin: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| AppError::Runtime(format!("failed to flush agent stdin: {err}")))
    }

    /// Close stdin so the agent sees end of input.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!(session_id = %self.session_id, "agent stdin closed");
        }
    }

    /// Last lines the agent wrote to stderr.
    pub async fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Wait for the process to exit, terminating it after `grace`.
    pub async fn wait_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                warn!(session_id = %self.session_id, %err, "error waiting for agent process");
                None
            }
            Err(_elapsed) => {
                warn!(
                    session_id = %self.session_id,
                    ?grace,
                    "agent process did not exit after closing its output, terminating"
                );
                self.terminate(grace).await;
                None
            }
        }
    }

    /// Ask the process to stop, then kill it if it is still alive after
    /// `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        self.close_stdin();
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }

        if self.graceful_stop(grace).await {
            return;
        }

        if let Err(err) = self.child.kill().await {
            warn!(session_id = %self.session_id, %err, "failed to kill agent process");
        } else {
            info!(session_id = %self.session_id, "agent process killed");
        }
    }

    #[cfg(unix)]
    async fn graceful_stop(&mut self, grace: Duration) -> bool {
        if !self.send_sigterm() {
            return false;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                debug!(session_id = %self.session_id, status = ?status.ok(), "agent process exited after SIGTERM");
                true
            }
            Err(_elapsed) => false,
        }
    }

    #[cfg(not(unix))]
    async fn graceful_stop(&mut self, _grace: Duration) -> bool {
        false
    }

    #[cfg(unix)]
    fn send_sigterm(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return false;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => true,
            Err(err) => {
                debug!(session_id = %self.session_id, %err, "SIGTERM failed");
                false
            }
        }
    }
}

/// Describe an unsuccessful exit, including the stderr tail when present.
#[must_use]
pub fn describe_exit(program: &str, status: Option<ExitStatus>, stderr_tail: &str) -> String {
    let reason = match status.and_then(|s| s.code()) {
        Some(code) => format!("{program} exited with code {code}"),
        None if status.is_some() => format!("{program} was terminated by a signal"),
        None => format!("{program} exited without a result"),
    };
    if stderr_tail.trim().is_empty() {
        reason
    } else {
        format!("{reason}: {}", stderr_tail.trim())
    }
}

async fn drain_stderr(
    session_id: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(session_id, line = %line, "agent stderr");
                let mut tail = tail.lock().await;
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(session_id, %err, "agent stderr read failed");
                break;
            }
        }
    }
}
