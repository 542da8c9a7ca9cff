//! Codex CLI runtime.
//!
//! Runs `codex exec --json` once per query with the prompt as the last
//! argument. The CLI emits one JSON event per line; a `thread.started` event
//! carries the thread id used to resume the conversation next time.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::models::inbound::QueryOptions;
use crate::models::session::AgentKind;
use crate::runtime::process::{describe_exit, spawn_process, AgentProcess, ProcessSpec};
use crate::runtime::{
    AgentMessage, AgentRuntime, QueryRequest, RuntimeEvent, StartFuture, EVENT_BUFFER,
};

/// Credential and configuration variables the Codex CLI reads.
pub const CREDENTIAL_ENV_VARS: &[&str] = &["OPENAI_API_KEY", "OPENAI_BASE_URL", "CODEX_HOME"];

/// [`AgentRuntime`] backed by the Codex CLI.
#[derive(Debug, Clone)]
pub struct CodexRuntime {
    config: RuntimeConfig,
    cancel_grace: Duration,
    max_line_bytes: usize,
}

impl CodexRuntime {
    /// Create a runtime launching `config.cli`.
    #[must_use]
    pub fn new(config: RuntimeConfig, cancel_grace: Duration, max_line_bytes: usize) -> Self {
        Self {
            config,
            cancel_grace,
            max_line_bytes,
        }
    }

    /// Command-line arguments for one query.
    #[must_use]
    pub fn command_args(&self, options: &QueryOptions, resume: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args = vec!["exec".to_owned(), "--json".to_owned()];
        if let Some(model) = &options.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        args.extend(self.config.args.iter().cloned());
        if let Some(thread_id) = resume {
            args.push("resume".into());
            args.push(thread_id.to_owned());
        }
        // The prompt is user text; it must never parse as a flag.
        args.push("--".into());
        args.push(prompt.to_owned());
        args
    }
}

impl AgentRuntime for CodexRuntime {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn start_query(&self, request: QueryRequest) -> StartFuture<'_> {
        Box::pin(async move {
            let args = self.command_args(&request.options, request.resume.as_deref(), &request.prompt);

            let mut inherit_env = self.config.inherit_env.clone();
            inherit_env.extend(CREDENTIAL_ENV_VARS.iter().map(|s| (*s).to_owned()));
            let spec = ProcessSpec {
                program: self.config.cli.clone(),
                args,
                cwd: request.options.cwd.clone(),
                inherit_env,
                extra_env: request.options.conductor_env.clone(),
                pipe_stdin: false,
            };
            let process = spawn_process(&spec, &request.session_id, self.max_line_bytes)?;

            let (events, rx) = mpsc::channel(EVENT_BUFFER);
            let span = info_span!("codex_query", session_id = %request.session_id);
            let turn = CodexTurn {
                program: self.config.cli.clone(),
                session_id: request.session_id,
                process,
                events,
                cancel: request.cancel,
                cancel_grace: self.cancel_grace,
                stream: CodexStream::default(),
            };
            tokio::spawn(turn.run().instrument(span));
            Ok(rx)
        })
    }
}

/// Terminal outcome reported by a Codex event.
#[derive(Debug, Clone, PartialEq)]
pub enum CodexOutcome {
    /// `turn.completed`.
    Completed,
    /// `turn.failed` or `error`.
    Failed(String),
}

impl CodexOutcome {
    /// Fold the outcome of the next event into the outcome so far.
    ///
    /// The first failure is kept (an `error` usually precedes `turn.failed`),
    /// but a later `turn.completed` means the turn recovered.
    #[must_use]
    pub fn settle(current: Option<Self>, next: Option<Self>) -> Option<Self> {
        match (current, next) {
            (_, Some(Self::Completed)) => Some(Self::Completed),
            (None, next) => next,
            (current, _) => current,
        }
    }
}

/// Translator from Codex JSON events to [`AgentMessage`]s.
#[derive(Debug, Default)]
pub struct CodexStream {
    text: String,
    thread_id: Option<String>,
}

impl CodexStream {
    /// Thread id reported by `thread.started`, once seen.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Translate one decoded event into a message and an optional outcome.
    pub fn on_event(&mut self, event: Value) -> (Option<AgentMessage>, Option<CodexOutcome>) {
        let kind = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let mut msg = AgentMessage::raw(event.clone());

        match kind.as_str() {
            "thread.started" => {
                if let Some(id) = event.get("thread_id").and_then(Value::as_str) {
                    self.thread_id = Some(id.to_owned());
                    msg.thread_id = Some(id.to_owned());
                }
                (Some(msg), None)
            }
            "item.completed" | "item.started" | "item.updated" => {
                let item = event.get("item").cloned().unwrap_or(Value::Null);
                match item.get("type").and_then(Value::as_str) {
                    Some("agent_message") if kind == "item.completed" => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            if !self.text.is_empty() {
                                self.text.push_str("\n\n");
                            }
                            self.text.push_str(text);
                            msg.text = Some(self.text.clone());
                            msg.text_delta = Some(text.to_owned());
                        }
                    }
                    Some(tool @ ("command_execution" | "file_change" | "mcp_tool_call" | "web_search")) => {
                        msg.tool_summary = Some(json!([{
                            "id": item.get("id").cloned().unwrap_or(Value::Null),
                            "name": tool,
                            "input": item,
                        }]));
                    }
                    _ => {}
                }
                (Some(msg), None)
            }
            "turn.completed" => {
                msg.is_final = true;
                msg.usage = event.get("usage").cloned();
                msg.thread_id.clone_from(&self.thread_id);
                if !self.text.is_empty() {
                    msg.text = Some(self.text.clone());
                }
                (Some(msg), Some(CodexOutcome::Completed))
            }
            "turn.failed" => {
                let error = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("codex turn failed")
                    .to_owned();
                (Some(msg), Some(CodexOutcome::Failed(error)))
            }
            "error" => {
                let error = event
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("codex reported an error")
                    .to_owned();
                (None, Some(CodexOutcome::Failed(error)))
            }
            _ => (Some(msg), None),
        }
    }
}

struct CodexTurn {
    program: String,
    session_id: String,
    process: AgentProcess,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
    cancel_grace: Duration,
    stream: CodexStream,
}

impl CodexTurn {
    async fn run(mut self) {
        let mut outcome = None;

        loop {
            let line = tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    info!(session_id = %self.session_id, "codex: query cancelled, stopping process");
                    self.process.terminate(self.cancel_grace).await;
                    return;
                }

                line = self.process.stdout.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(session_id = %self.session_id, %err, "codex: stdout read failed");
                    break;
                }
            };

            let event: Value = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(err) => {
                    debug!(session_id = %self.session_id, %err, "codex: ignoring non-JSON stdout line");
                    continue;
                }
            };

            let (msg, result) = self.stream.on_event(event);
            if let Some(msg) = msg {
                if self.events.send(RuntimeEvent::Message(msg)).await.is_err() {
                    self.process.terminate(self.cancel_grace).await;
                    return;
                }
            }
            outcome = CodexOutcome::settle(outcome, result);
        }

        let status = self.process.wait_exit(self.cancel_grace).await;
        let event = match outcome {
            Some(CodexOutcome::Completed) => RuntimeEvent::Completed,
            Some(CodexOutcome::Failed(error)) => RuntimeEvent::Failed { error, data: None },
            None if status.is_some_and(|s| s.success()) => RuntimeEvent::Completed,
            None => {
                let tail = self.process.stderr_tail().await;
                RuntimeEvent::Failed {
                    error: describe_exit(&self.program, status, &tail),
                    data: None,
                }
            }
        };
        debug!(session_id = %self.session_id, ?status, "codex: process exited");
        let _ = self.events.send(event).await;
    }
}
