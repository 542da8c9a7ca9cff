//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent back end a session is bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Claude Code CLI.
    Claude,
    /// `OpenAI` Codex CLI.
    Codex,
}

impl AgentKind {
    /// Every supported kind, in orchestrator registration order.
    pub const ALL: [Self; 2] = [Self::Claude, Self::Codex];

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Known but no query has run, or the last query was reset.
    Idle,
    /// A query is in flight.
    Running,
    /// The last query was cancelled by a client.
    Cancelled,
    /// The last query failed.
    Error,
    /// The last query completed successfully.
    Done,
}

impl SessionStatus {
    /// Whether the status ends a query.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Error | Self::Done)
    }
}

/// Session state owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Client-supplied identifier.
    pub id: String,
    /// Agent back end serving the session.
    pub agent_kind: AgentKind,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Last permission mode requested by the client.
    pub permission_mode: Option<String>,
    /// Conversation id reported by the Claude runtime, used to resume.
    pub agent_session_id: Option<String>,
    /// Thread id reported by the Codex runtime, used to resume.
    pub thread_id: Option<String>,
    /// Most recent token usage snapshot reported by the runtime.
    pub context_usage: Option<Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct an idle session.
    #[must_use]
    pub fn new(id: impl Into<String>, agent_kind: AgentKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_kind,
            status: SessionStatus::Idle,
            permission_mode: None,
            agent_session_id: None,
            thread_id: None,
            context_usage: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Idle
                    | SessionStatus::Cancelled
                    | SessionStatus::Error
                    | SessionStatus::Done,
                SessionStatus::Running
            ) | (
                SessionStatus::Running,
                SessionStatus::Idle
                    | SessionStatus::Cancelled
                    | SessionStatus::Error
                    | SessionStatus::Done
            )
        )
    }

    /// Resume handle the runtime should continue from, if any.
    #[must_use]
    pub fn resume_token(&self) -> Option<&str> {
        match self.agent_kind {
            AgentKind::Claude => self.agent_session_id.as_deref(),
            AgentKind::Codex => self.thread_id.as_deref(),
        }
    }
}
