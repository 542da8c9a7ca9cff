//! Agent runtime abstraction.
//!
//! A runtime performs the actual agent reasoning for one query and reports
//! progress as a stream of [`RuntimeEvent`]s. The orchestrator never talks
//! to an agent process directly; it consumes events and answers the
//! runtime's questions through the `reply` senders carried by them.
//!
//! Two process-backed implementations ship with the crate:
//! [`claude::ClaudeRuntime`] and [`codex::CodexRuntime`].

pub mod claude;
pub mod codex;
pub mod process;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::models::inbound::QueryOptions;
use crate::models::reverse::{DiffOutcome, PlanDecision, QuestionOutcome, UserQuestion};
use crate::models::session::AgentKind;
use crate::Result;

/// Capacity of the per-query event channel.
pub const EVENT_BUFFER: usize = 64;

/// Boxed future returned by [`AgentRuntime::start_query`].
pub type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<QueryEvents>> + Send + 'a>>;

/// Receiving end of a running query.
pub type QueryEvents = mpsc::Receiver<RuntimeEvent>;

/// Everything a runtime needs to run one query.
#[derive(Debug)]
pub struct QueryRequest {
    /// Session the query belongs to.
    pub session_id: String,
    /// User prompt.
    pub prompt: String,
    /// Client-supplied runtime options.
    pub options: QueryOptions,
    /// Resume handle: the explicit option, or the one stored on the session.
    pub resume: Option<String>,
    /// Current permission mode; updated while the query runs.
    pub permission_mode: watch::Receiver<Option<String>>,
    /// Fires when the client cancels the query.
    pub cancel: CancellationToken,
}

/// One piece of streamed agent output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentMessage {
    /// Raw runtime event, forwarded to the client untouched.
    pub data: Value,
    /// Full assistant text so far.
    pub text: Option<String>,
    /// Text added by this event.
    pub text_delta: Option<String>,
    /// Set on the last message of the query.
    pub is_final: bool,
    /// Tool calls carried by the event.
    pub tool_summary: Option<Value>,
    /// Codex thread id, once known.
    pub thread_id: Option<String>,
    /// Claude conversation id, once known.
    pub agent_session_id: Option<String>,
    /// Token usage snapshot, when the event reports one.
    pub usage: Option<Value>,
}

impl AgentMessage {
    /// A message carrying only the raw event.
    #[must_use]
    pub fn raw(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// Event emitted by a runtime while a query runs.
///
/// A well-behaved runtime ends every stream with exactly one
/// [`RuntimeEvent::Completed`] or [`RuntimeEvent::Failed`]. A stream that
/// closes without either is treated as a failure.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// Streamed output.
    Message(AgentMessage),
    /// The agent switched itself into plan mode.
    PlanModeEntered,
    /// The agent wants its plan approved before continuing.
    PlanApprovalNeeded {
        /// Plan tool input.
        tool_input: Value,
        /// Where the decision goes.
        reply: oneshot::Sender<PlanDecision>,
    },
    /// The agent asks the user multiple-choice questions.
    QuestionNeeded {
        /// Ordered questions.
        questions: Vec<UserQuestion>,
        /// Where the answers go.
        reply: oneshot::Sender<QuestionOutcome>,
    },
    /// The agent asks for the workspace diff.
    DiffNeeded {
        /// Restrict to one file.
        file: Option<String>,
        /// Request `--stat` output.
        stat: Option<bool>,
        /// Where the diff goes.
        reply: oneshot::Sender<DiffOutcome>,
    },
    /// The query finished successfully.
    Completed,
    /// The query failed.
    Failed {
        /// Human-readable failure.
        error: String,
        /// Structured detail.
        data: Option<Value>,
    },
}

/// An agent back end able to run queries.
pub trait AgentRuntime: Send + Sync {
    /// Agent kind this runtime serves.
    fn kind(&self) -> AgentKind;

    /// Start a query and return its event stream.
    ///
    /// Returns once the query is underway; the events arrive on the
    /// returned receiver. Cancelling `request.cancel` must make the runtime
    /// stop promptly; it may still emit a final event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` when the query cannot be started at all.
    fn start_query(&self, request: QueryRequest) -> StartFuture<'_>;
}
