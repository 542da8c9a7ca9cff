//! Server → client channel used by a running query.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::models::outbound::{
    MessagePayload, PlanModePayload, QueryErrorPayload, ENTER_PLAN_MODE, MESSAGE, QUERY_ERROR,
};
use crate::models::reverse::{
    AskUserQuestionParams, AskUserQuestionReply, DiffOutcome, DiffReply, ExitPlanModeParams,
    GetDiffParams, PlanDecision, QuestionOutcome, ReverseKind,
};
use crate::rpc::RpcPeer;
use crate::Result;

/// Handle on the connection that started a query.
///
/// Notifications return an error once the connection is gone. Reverse
/// requests never fail: a closed connection, a timeout, an error response,
/// or an unparseable answer all resolve as the declined outcome.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    peer: Arc<RpcPeer>,
    reverse_timeout: Option<Duration>,
}

impl ClientHandle {
    /// Wrap `peer`; reverse requests give up after `reverse_timeout`.
    #[must_use]
    pub fn new(peer: Arc<RpcPeer>, reverse_timeout: Option<Duration>) -> Self {
        Self {
            peer,
            reverse_timeout,
        }
    }

    /// Connection the handle writes to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.peer.connection_id()
    }

    /// Whether the connection has been stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    /// Resolves once the connection has been stopped.
    pub async fn closed(&self) {
        self.peer.closed().await;
    }

    /// Send a `message` notification.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionClosed` once the connection is gone.
    pub async fn send_message(&self, payload: &MessagePayload) -> Result<()> {
        self.peer.notify(MESSAGE, payload).await
    }

    /// Send a `queryError` notification.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionClosed` once the connection is gone.
    pub async fn send_error(&self, payload: &QueryErrorPayload) -> Result<()> {
        self.peer.notify(QUERY_ERROR, payload).await
    }

    /// Send an `enterPlanModeNotification`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionClosed` once the connection is gone.
    pub async fn send_plan_mode(&self, payload: &PlanModePayload) -> Result<()> {
        self.peer.notify(ENTER_PLAN_MODE, payload).await
    }

    /// Ask the client to approve a plan.
    pub async fn request_plan_approval(&self, params: &ExitPlanModeParams) -> PlanDecision {
        self.reverse(ReverseKind::PlanApproval, params)
            .await
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_else(PlanDecision::declined)
    }

    /// Ask the client one or more multiple-choice questions.
    pub async fn request_answers(&self, params: &AskUserQuestionParams) -> QuestionOutcome {
        self.reverse(ReverseKind::Question, params)
            .await
            .and_then(|value| serde_json::from_value::<AskUserQuestionReply>(value).ok())
            .map_or(QuestionOutcome::Declined, |reply| {
                QuestionOutcome::from_reply(reply, params.questions.len())
            })
    }

    /// Ask the client for the workspace diff.
    pub async fn request_diff(&self, params: &GetDiffParams) -> DiffOutcome {
        match self.reverse(ReverseKind::DiffRequest, params).await {
            Some(value) => serde_json::from_value::<DiffReply>(value).map_or_else(
                |err| DiffOutcome::Unavailable(format!("invalid getDiff reply: {err}")),
                DiffOutcome::from,
            ),
            None => DiffOutcome::Unavailable("client did not provide a diff".into()),
        }
    }

    async fn reverse(&self, kind: ReverseKind, params: impl Serialize) -> Option<Value> {
        let method = kind.method();
        let outcome = match self.reverse_timeout {
            Some(limit) => self.peer.request_with_timeout(method, params, limit).await,
            None => self.peer.request(method, params).await,
        };
        match outcome {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    connection_id = %self.peer.connection_id(),
                    method,
                    %err,
                    "reverse request unanswered, treating as declined"
                );
                None
            }
        }
    }
}
