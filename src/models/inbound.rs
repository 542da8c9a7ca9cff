//! Typed parameters for client → server calls.
//!
//! Every inbound payload is deserialized into one of these structs exactly
//! once, at the method-table boundary. Handlers never re-inspect raw JSON.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::models::session::AgentKind;
use crate::rpc::RpcError;

/// Options accompanying a `query` notification.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Working directory the agent runs in.
    pub cwd: PathBuf,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Initial permission mode.
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Explicit resume handle; falls back to the one stored on the session.
    #[serde(default)]
    pub resume: Option<String>,
    /// Extra directories the agent may access.
    #[serde(default)]
    pub additional_directories: Vec<PathBuf>,
    /// Extra environment variables for the agent process.
    #[serde(default)]
    pub conductor_env: HashMap<String, String>,
    /// Client-side turn counter, echoed in plan approvals.
    #[serde(default)]
    pub turn_id: Option<i64>,
    /// Options this layer does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryOptions {
    /// Options with only a working directory.
    #[must_use]
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            model: None,
            permission_mode: None,
            resume: None,
            additional_directories: Vec::new(),
            conductor_env: HashMap::new(),
            turn_id: None,
            extra: Map::new(),
        }
    }
}

/// `query` notification parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    /// Session id.
    pub id: String,
    /// Agent back end.
    #[serde(alias = "agentType")]
    pub agent_kind: AgentKind,
    /// User prompt.
    pub prompt: String,
    /// Runtime options.
    pub options: QueryOptions,
}

/// `cancel` request parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    /// Session id.
    pub id: String,
    /// Agent back end; looked up in the registry when omitted.
    #[serde(default, alias = "agentType")]
    pub agent_kind: Option<AgentKind>,
}

/// Options carrying only a working directory.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CwdOptions {
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// `claudeAuth` request parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthParams {
    /// Session id the check is made for.
    #[serde(default)]
    pub id: Option<String>,
    /// Check options.
    #[serde(default)]
    pub options: CwdOptions,
}

/// Options for `workspaceInit`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceOptions {
    /// Workspace directory.
    pub cwd: PathBuf,
    /// Options this layer does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `workspaceInit` request parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInitParams {
    /// Session id.
    pub id: String,
    /// Agent back end for a newly created session; defaults to Claude.
    #[serde(default, alias = "agentType")]
    pub agent_kind: Option<AgentKind>,
    /// Workspace options.
    pub options: WorkspaceOptions,
}

/// Options for `contextUsage`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsageOptions {
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Agent-side conversation id, when the client tracks it.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `contextUsage` request parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsageParams {
    /// Session id.
    pub id: String,
    /// Lookup options.
    #[serde(default)]
    pub options: ContextUsageOptions,
}

/// `updatePermissionMode` notification parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionModeParams {
    /// Session id.
    pub id: String,
    /// New permission mode.
    pub permission_mode: String,
    /// Agent back end; looked up in the registry when omitted.
    #[serde(default, alias = "agentType")]
    pub agent_kind: Option<AgentKind>,
}

/// Deserialize `params` into a typed struct, mapping failures to `-32602`.
///
/// # Errors
///
/// Returns [`RpcError`] with code `INVALID_PARAMS` describing the mismatch.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}
