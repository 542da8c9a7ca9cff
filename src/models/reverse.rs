//! Reverse requests: questions the server asks the client mid-query.
//!
//! Each exchange has a wire request, a wire reply, and a typed outcome the
//! runtime consumes. Conversion from reply to outcome happens here, once, so
//! the rest of the crate never sees the legacy sentinel answer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reverse request asking the client to approve a plan.
pub const EXIT_PLAN_MODE: &str = "exitPlanMode";
/// Reverse request asking the client one or more multiple-choice questions.
pub const ASK_USER_QUESTION: &str = "askUserQuestion";
/// Reverse request asking the client for the workspace diff.
pub const GET_DIFF: &str = "getDiff";

/// Answer value older clients send when the user dismissed the dialog.
pub const LEGACY_DECLINE_SENTINEL: &str = "USER_CANCELLED";

/// What a reverse exchange is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseKind {
    /// `exitPlanMode`.
    PlanApproval,
    /// `askUserQuestion`.
    Question,
    /// `getDiff`.
    DiffRequest,
}

impl ReverseKind {
    /// Wire method name.
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::PlanApproval => EXIT_PLAN_MODE,
            Self::Question => ASK_USER_QUESTION,
            Self::DiffRequest => GET_DIFF,
        }
    }
}

/// `exitPlanMode` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExitPlanModeParams {
    /// Session id.
    pub session_id: String,
    /// The agent's plan tool input, forwarded untouched.
    pub tool_input: Value,
}

/// Client decision on a plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanDecision {
    /// Whether the plan was approved.
    #[serde(default)]
    pub approved: bool,
    /// Client turn the approval belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<i64>,
}

impl PlanDecision {
    /// Decision used when no answer could be obtained.
    #[must_use]
    pub fn declined() -> Self {
        Self::default()
    }
}

/// One multiple-choice question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserQuestion {
    /// Question text.
    pub question: String,
    /// Offered choices.
    #[serde(default)]
    pub options: Vec<String>,
}

/// `askUserQuestion` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AskUserQuestionParams {
    /// Session id.
    pub session_id: String,
    /// Ordered questions.
    pub questions: Vec<UserQuestion>,
}

/// Raw `askUserQuestion` reply as sent by the client.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AskUserQuestionReply {
    /// Answers, positionally matched to the questions.
    #[serde(default)]
    pub answers: Option<Vec<String>>,
    /// Explicit dismissal.
    #[serde(default)]
    pub declined: bool,
}

/// Outcome of a question exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionOutcome {
    /// One answer per question, in question order.
    Answered(Vec<String>),
    /// The user dismissed the questions, or no answer could be obtained.
    Declined,
}

impl QuestionOutcome {
    /// Interpret a client reply for `expected` questions.
    ///
    /// A reply is declined when it says so explicitly, carries no answers,
    /// contains the legacy sentinel, or does not answer every question.
    #[must_use]
    pub fn from_reply(reply: AskUserQuestionReply, expected: usize) -> Self {
        if reply.declined {
            return Self::Declined;
        }
        match reply.answers {
            Some(answers)
                if answers.len() == expected
                    && !answers.iter().any(|a| a == LEGACY_DECLINE_SENTINEL) =>
            {
                Self::Answered(answers)
            }
            _ => Self::Declined,
        }
    }
}

/// `getDiff` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetDiffParams {
    /// Session id.
    pub session_id: String,
    /// Restrict the diff to one file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Request `--stat` output instead of a patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<bool>,
}

/// Raw `getDiff` reply.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DiffReply {
    /// Diff text.
    #[serde(default)]
    pub diff: Option<String>,
    /// Why no diff could be produced.
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome of a diff exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Diff text (possibly empty when the tree is clean).
    Diff(String),
    /// No diff available, with the reason.
    Unavailable(String),
}

impl From<DiffReply> for DiffOutcome {
    fn from(reply: DiffReply) -> Self {
        match (reply.diff, reply.error) {
            (_, Some(error)) => Self::Unavailable(error),
            (Some(diff), None) => Self::Diff(diff),
            (None, None) => Self::Diff(String::new()),
        }
    }
}
