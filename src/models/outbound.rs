//! Server → client notification payloads.

use serde::Serialize;
use serde_json::Value;

use crate::models::session::AgentKind;

/// Notification method carrying streamed agent output.
pub const MESSAGE: &str = "message";
/// Notification method carrying a query failure.
pub const QUERY_ERROR: &str = "queryError";
/// Notification method announcing that the agent entered plan mode.
pub const ENTER_PLAN_MODE: &str = "enterPlanModeNotification";

/// Agent kind as carried on outbound payloads.
///
/// Flattened into each payload. Host builds that predate `agentKind` read
/// `agentType`, so both keys are written.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTag {
    /// Legacy key.
    pub agent_type: AgentKind,
    /// Current key.
    pub agent_kind: AgentKind,
}

impl From<AgentKind> for AgentTag {
    fn from(kind: AgentKind) -> Self {
        Self {
            agent_type: kind,
            agent_kind: kind,
        }
    }
}

/// `message` notification payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Session id.
    pub id: String,
    /// Always `"message"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Agent back end that produced the message.
    #[serde(flatten)]
    pub agent: AgentTag,
    /// Raw runtime event.
    pub data: Value,
    /// Full text of the assistant message so far, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Incremental text since the previous message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    /// Set on the last message of a query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    /// Summary of tool calls carried by the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_summary: Option<Value>,
    /// Codex thread id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Claude conversation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

/// `queryError` notification payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryErrorPayload {
    /// Session id.
    pub id: String,
    /// Always `"error"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Agent back end the query targeted.
    #[serde(flatten)]
    pub agent: AgentTag,
    /// Human-readable failure.
    pub error: String,
    /// Structured detail, when the runtime supplied some.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl QueryErrorPayload {
    /// Build a payload with no structured detail.
    #[must_use]
    pub fn new(id: impl Into<String>, agent_kind: AgentKind, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "error",
            agent: agent_kind.into(),
            error: error.into(),
            data: None,
        }
    }
}

/// `enterPlanModeNotification` payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanModePayload {
    /// Session id.
    pub id: String,
    /// Agent back end.
    #[serde(flatten)]
    pub agent: AgentTag,
}
