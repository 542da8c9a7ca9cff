//! Claude Code CLI runtime.
//!
//! Runs `claude -p` in bidirectional stream-json mode. The prompt goes in as
//! a `user` message on stdin; stdout carries the event stream. Tool
//! permission prompts arrive as `control_request` lines and are answered
//! with `control_response` lines, which is how plan approval and
//! multiple-choice questions reach the client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::models::inbound::QueryOptions;
use crate::models::reverse::{PlanDecision, QuestionOutcome, UserQuestion};
use crate::models::session::AgentKind;
use crate::runtime::process::{describe_exit, spawn_process, AgentProcess, ProcessSpec};
use crate::runtime::{
    AgentMessage, AgentRuntime, QueryRequest, RuntimeEvent, StartFuture, EVENT_BUFFER,
};

/// Credential and configuration variables the Claude CLI reads.
pub const CREDENTIAL_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "ANTHROPIC_BASE_URL",
    "CLAUDE_CONFIG_DIR",
];

const PLAN_REJECTED: &str = "The user rejected the plan. Stay in plan mode and revise it.";
const QUESTION_DECLINED: &str = "The user declined to answer.";

/// [`AgentRuntime`] backed by the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeRuntime {
    config: RuntimeConfig,
    cancel_grace: Duration,
    max_line_bytes: usize,
}

impl ClaudeRuntime {
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
    pub fn command_args(
        &self,
        options: &QueryOptions,
        resume: Option<&str>,
        permission_mode: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

        if let Some(model) = &options.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(mode) = permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.to_owned());
        }
        if let Some(resume) = resume {
            args.push("--resume".into());
            args.push(resume.to_owned());
        }
        for dir in &options.additional_directories {
            args.push("--add-dir".into());
            args.push(dir.display().to_string());
        }
        args.extend(self.config.args.iter().cloned());
        args
    }
}

impl AgentRuntime for ClaudeRuntime {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn start_query(&self, mut request: QueryRequest) -> StartFuture<'_> {
        Box::pin(async move {
            let permission_mode = request
                .permission_mode
                .borrow_and_update()
                .clone()
                .or_else(|| request.options.permission_mode.clone());
            let args = self.command_args(
                &request.options,
                request.resume.as_deref(),
                permission_mode.as_deref(),
            );

            let mut inherit_env = self.config.inherit_env.clone();
            inherit_env.extend(CREDENTIAL_ENV_VARS.iter().map(|s| (*s).to_owned()));
            let spec = ProcessSpec {
                program: self.config.cli.clone(),
                args,
                cwd: request.options.cwd.clone(),
                inherit_env,
                extra_env: request.options.conductor_env.clone(),
                pipe_stdin: true,
            };

            let mut process = spawn_process(&spec, &request.session_id, self.max_line_bytes)?;
            process.write_json(&user_message(&request.prompt)).await?;

            let (events, rx) = mpsc::channel(EVENT_BUFFER);
            let span = info_span!("claude_query", session_id = %request.session_id);
            let turn = ClaudeTurn {
                program: self.config.cli.clone(),
                session_id: request.session_id,
                process,
                events,
                permission_mode: request.permission_mode,
                cancel: request.cancel,
                cancel_grace: self.cancel_grace,
                stream: ClaudeStream::default(),
                next_control_id: 1,
            };
            tokio::spawn(turn.run().instrument(span));
            Ok(rx)
        })
    }
}

/// The `user` stream-json message carrying a prompt.
#[must_use]
pub fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": prompt }],
        },
    })
}

/// `control_response` granting a tool call.
#[must_use]
pub fn allow_response(request_id: &str, updated_input: Value) -> Value {
    control_response(
        request_id,
        json!({ "behavior": "allow", "updatedInput": updated_input }),
    )
}

/// `control_response` refusing a tool call.
#[must_use]
pub fn deny_response(request_id: &str, message: &str) -> Value {
    control_response(
        request_id,
        json!({ "behavior": "deny", "message": message }),
    )
}

fn control_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
}

fn control_error(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        },
    })
}

/// Questions carried by an `AskUserQuestion` tool input.
///
/// Options may be plain strings or `{label, description}` objects.
#[must_use]
pub fn parse_questions(input: &Value) -> Vec<UserQuestion> {
    let Some(questions) = input.get("questions").and_then(Value::as_array) else {
        return Vec::new();
    };
    questions
        .iter()
        .filter_map(|q| {
            let question = q.get("question").and_then(Value::as_str)?.to_owned();
            let options = q
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| {
                            o.as_str()
                                .or_else(|| o.get("label").and_then(Value::as_str))
                                .map(str::to_owned)
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(UserQuestion { question, options })
        })
        .collect()
}

/// Tool input with the user's answers attached, keyed by question text.
#[must_use]
pub fn answered_input(mut input: Value, questions: &[UserQuestion], answers: &[String]) -> Value {
    let answers: Map<String, Value> = questions
        .iter()
        .zip(answers)
        .map(|(q, a)| (q.question.clone(), Value::String(a.clone())))
        .collect();
    if let Some(obj) = input.as_object_mut() {
        obj.insert("answers".into(), Value::Object(answers));
    }
    input
}

/// What the driver must do in response to one stdout event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaudeAction {
    /// Forward output to the client.
    Emit(AgentMessage),
    /// A `can_use_tool` prompt awaiting a `control_response`.
    ToolPermission {
        /// Control request id to answer.
        request_id: String,
        /// Tool the agent wants to run.
        tool_name: String,
        /// Tool input.
        input: Value,
    },
    /// A control request this runtime does not handle.
    UnsupportedControl {
        /// Control request id to answer.
        request_id: String,
        /// Request subtype.
        subtype: String,
    },
    /// The `result` event arrived; `failure` is set when it reports an error.
    Finished {
        /// Error text and the raw event.
        failure: Option<(String, Value)>,
    },
}

/// Translator from Claude stream-json events to [`ClaudeAction`]s.
#[derive(Debug, Default)]
pub struct ClaudeStream {
    text: String,
    agent_session_id: Option<String>,
}

impl ClaudeStream {
    /// Conversation id reported by `system/init`, once seen.
    #[must_use]
    pub fn agent_session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }

    /// Translate one decoded stdout event.
    pub fn on_event(&mut self, event: Value) -> Vec<ClaudeAction> {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "system" => {
                let mut msg = AgentMessage::raw(event.clone());
                if event.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(id) = event.get("session_id").and_then(Value::as_str) {
                        self.agent_session_id = Some(id.to_owned());
                        msg.agent_session_id = Some(id.to_owned());
                    }
                }
                vec![ClaudeAction::Emit(msg)]
            }
            "assistant" => vec![ClaudeAction::Emit(self.assistant_message(event))],
            "result" => self.result_actions(event),
            "control_request" => vec![control_action(&event)],
            "control_response" | "keep_alive" => {
                debug!(kind, "claude: control traffic");
                Vec::new()
            }
            _ => vec![ClaudeAction::Emit(AgentMessage::raw(event))],
        }
    }

    fn assistant_message(&mut self, event: Value) -> AgentMessage {
        let mut delta = String::new();
        let mut tools = Vec::new();

        let blocks = event
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        delta.push_str(text);
                    }
                }
                Some("tool_use") => tools.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "input": block.get("input").cloned().unwrap_or(Value::Null),
                })),
                _ => {}
            }
        }

        let mut msg = AgentMessage::raw(event);
        if !delta.is_empty() {
            if !self.text.is_empty() {
                self.text.push_str("\n\n");
            }
            self.text.push_str(&delta);
            msg.text = Some(self.text.clone());
            msg.text_delta = Some(delta);
        }
        if !tools.is_empty() {
            msg.tool_summary = Some(Value::Array(tools));
        }
        msg
    }

    fn result_actions(&mut self, event: Value) -> Vec<ClaudeAction> {
        let subtype = event
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("success")
            .to_owned();
        let is_error = event
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || subtype != "success";
        let result_text = event
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_owned);

        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
            self.agent_session_id = Some(id.to_owned());
        }

        let mut msg = AgentMessage::raw(event.clone());
        msg.is_final = true;
        msg.usage = event.get("usage").cloned();
        msg.agent_session_id.clone_from(&self.agent_session_id);
        msg.text = result_text
            .clone()
            .or_else(|| (!self.text.is_empty()).then(|| self.text.clone()));

        let failure = is_error.then(|| {
            let error = result_text.unwrap_or_else(|| format!("claude query failed: {subtype}"));
            (error, event)
        });
        vec![ClaudeAction::Emit(msg), ClaudeAction::Finished { failure }]
    }
}

fn control_action(event: &Value) -> ClaudeAction {
    let request_id = event
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let request = event.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    if subtype == "can_use_tool" {
        ClaudeAction::ToolPermission {
            request_id,
            tool_name: request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            input: request.get("input").cloned().unwrap_or_else(|| json!({})),
        }
    } else {
        ClaudeAction::UnsupportedControl {
            request_id,
            subtype,
        }
    }
}

/// Per-query driver owning the Claude process.
struct ClaudeTurn {
    program: String,
    session_id: String,
    process: AgentProcess,
    events: mpsc::Sender<RuntimeEvent>,
    permission_mode: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
    cancel_grace: Duration,
    stream: ClaudeStream,
    next_control_id: u64,
}

impl ClaudeTurn {
    async fn run(mut self) {
        let mut watching_mode = true;
        let mut finished = false;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    info!(session_id = %self.session_id, "claude: query cancelled, stopping process");
                    self.process.terminate(self.cancel_grace).await;
                    return;
                }

                changed = self.permission_mode.changed(), if watching_mode => {
                    if changed.is_err() {
                        watching_mode = false;
                        continue;
                    }
                    let mode = self.permission_mode.borrow_and_update().clone();
                    if let Some(mode) = mode {
                        self.send_permission_mode(&mode).await;
                    }
                }

                line = self.process.stdout.next_line() => match line {
                    Ok(Some(line)) => match self.on_line(&line).await {
                        Ok(done) => finished |= done,
                        Err(()) => {
                            self.process.terminate(self.cancel_grace).await;
                            return;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(session_id = %self.session_id, %err, "claude: stdout read failed");
                        break;
                    }
                },
            }
        }

        let status = self.process.wait_exit(self.cancel_grace).await;
        if finished {
            debug!(session_id = %self.session_id, ?status, "claude: process exited");
            return;
        }

        let tail = self.process.stderr_tail().await;
        let error = describe_exit(&self.program, status, &tail);
        warn!(session_id = %self.session_id, %error, "claude: process ended without a result");
        let _ = self
            .events
            .send(RuntimeEvent::Failed { error, data: None })
            .await;
    }

    /// Handle one stdout line. `Ok(true)` once the result arrived; `Err` when
    /// the query should be abandoned.
    async fn on_line(&mut self, line: &str) -> Result<bool, ()> {
        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                debug!(session_id = %self.session_id, %err, "claude: ignoring non-JSON stdout line");
                return Ok(false);
            }
        };

        let mut finished = false;
        for action in self.stream.on_event(event) {
            match action {
                ClaudeAction::Emit(msg) => self.emit(RuntimeEvent::Message(msg)).await?,
                ClaudeAction::ToolPermission {
                    request_id,
                    tool_name,
                    input,
                } => {
                    let response = self.decide_tool(&request_id, &tool_name, input).await?;
                    self.write(&response).await;
                }
                ClaudeAction::UnsupportedControl {
                    request_id,
                    subtype,
                } => {
                    debug!(session_id = %self.session_id, %subtype, "claude: unsupported control request");
                    let response = control_error(&request_id, &format!("unsupported control request: {subtype}"));
                    self.write(&response).await;
                }
                ClaudeAction::Finished { failure } => {
                    self.process.close_stdin();
                    finished = true;
                    let event = match failure {
                        None => RuntimeEvent::Completed,
                        Some((error, data)) => RuntimeEvent::Failed {
                            error,
                            data: Some(data),
                        },
                    };
                    self.emit(event).await?;
                }
            }
        }
        Ok(finished)
    }

    async fn decide_tool(
        &mut self,
        request_id: &str,
        tool_name: &str,
        input: Value,
    ) -> Result<Value, ()> {
        match tool_name {
            "ExitPlanMode" => {
                let (reply, rx) = oneshot::channel();
                self.emit(RuntimeEvent::PlanApprovalNeeded {
                    tool_input: input.clone(),
                    reply,
                })
                .await?;
                let decision = self.await_reply(rx).await?.unwrap_or_else(PlanDecision::declined);
                info!(session_id = %self.session_id, approved = decision.approved, "claude: plan decision");
                Ok(if decision.approved {
                    allow_response(request_id, input)
                } else {
                    deny_response(request_id, PLAN_REJECTED)
                })
            }
            "AskUserQuestion" => {
                let questions = parse_questions(&input);
                let (reply, rx) = oneshot::channel();
                self.emit(RuntimeEvent::QuestionNeeded {
                    questions: questions.clone(),
                    reply,
                })
                .await?;
                match self.await_reply(rx).await?.unwrap_or(QuestionOutcome::Declined) {
                    QuestionOutcome::Answered(answers) => Ok(allow_response(
                        request_id,
                        answered_input(input, &questions, &answers),
                    )),
                    QuestionOutcome::Declined => Ok(deny_response(request_id, QUESTION_DECLINED)),
                }
            }
            "EnterPlanMode" => {
                self.emit(RuntimeEvent::PlanModeEntered).await?;
                Ok(allow_response(request_id, input))
            }
            _ => Ok(allow_response(request_id, input)),
        }
    }

    /// `Ok(None)` when the orchestrator dropped the reply sender.
    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<Option<T>, ()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(()),
            outcome = rx => Ok(outcome.ok()),
        }
    }

    async fn emit(&self, event: RuntimeEvent) -> Result<(), ()> {
        self.events.send(event).await.map_err(|_| {
            debug!(session_id = %self.session_id, "claude: event receiver dropped");
        })
    }

    async fn send_permission_mode(&mut self, mode: &str) {
        let request_id = format!("sidecar-{}", self.next_control_id);
        self.next_control_id += 1;
        let request = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": { "subtype": "set_permission_mode", "mode": mode },
        });
        info!(session_id = %self.session_id, mode, "claude: forwarding permission mode");
        self.write(&request).await;
    }

    async fn write(&mut self, value: &Value) {
        if let Err(err) = self.process.write_json(value).await {
            warn!(session_id = %self.session_id, %err, "claude: failed to write control message");
        }
    }
}

/// Result of a `claudeAuth` check.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuthStatus {
    /// Whether the CLI has usable credentials.
    pub authenticated: bool,
    /// How it authenticates: `api_key`, `oauth_token`, or `credentials_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl AuthStatus {
    /// Inspect the process environment and the user's Claude config dir.
    #[must_use]
    pub fn detect() -> Self {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from);
        Self::detect_with(|key| std::env::var(key).ok(), home.as_deref())
    }

    /// Like [`AuthStatus::detect`] with an injectable environment.
    #[must_use]
    pub fn detect_with(env: impl Fn(&str) -> Option<String>, home: Option<&Path>) -> Self {
        let set = |key: &str| env(key).is_some_and(|v| !v.trim().is_empty());

        let method = if set("ANTHROPIC_API_KEY") {
            Some("api_key")
        } else if set("CLAUDE_CODE_OAUTH_TOKEN") {
            Some("oauth_token")
        } else {
            let config_dir = env("CLAUDE_CONFIG_DIR")
                .map(PathBuf::from)
                .or_else(|| home.map(|h| h.join(".claude")));
            config_dir
                .is_some_and(|dir| dir.join(".credentials.json").is_file())
                .then_some("credentials_file")
        };

        Self {
            authenticated: method.is_some(),
            method: method.map(str::to_owned),
        }
    }
}
