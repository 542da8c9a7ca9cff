//! Inbound method table registered on every connection.
//!
//! | method                 | kind         |
//! |------------------------|--------------|
//! | `query`                | notification |
//! | `cancel`               | request      |
//! | `claudeAuth`           | request      |
//! | `workspaceInit`        | request      |
//! | `contextUsage`         | request      |
//! | `updatePermissionMode` | notification |

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::models::inbound::{
    parse_params, AuthParams, CancelParams, ContextUsageParams, PermissionModeParams, QueryParams,
    WorkspaceInitParams,
};
use crate::models::outbound::QueryErrorPayload;
use crate::models::session::AgentKind;
use crate::orchestrator::{ClientHandle, Orchestrators};
use crate::rpc::{RpcError, RpcPeer};
use crate::runtime::claude::AuthStatus;
use crate::AppError;

/// Register the sidecar methods on `peer`.
///
/// `client` must wrap the same peer; queries started on this connection
/// report back through it.
pub async fn register(peer: &Arc<RpcPeer>, orchestrators: Orchestrators, client: ClientHandle) {
    {
        let orchestrators = orchestrators.clone();
        peer.add_method("query", move |params| {
            let orchestrators = orchestrators.clone();
            let client = client.clone();
            async move { query(&orchestrators, client, params).await }
        })
        .await;
    }

    {
        let orchestrators = orchestrators.clone();
        peer.add_method("cancel", move |params| {
            let orchestrators = orchestrators.clone();
            async move {
                let params: CancelParams = parse_params(params)?;
                let cancelled = orchestrators.cancel(&params.id, params.agent_kind).await;
                Ok(json!({ "cancelled": cancelled }))
            }
        })
        .await;
    }

    peer.add_method("claudeAuth", |params| async move {
        let params: Option<AuthParams> = parse_params(params)?;
        // Reads the credentials file; keep it off the read loop.
        let status = tokio::task::spawn_blocking(AuthStatus::detect)
            .await
            .map_err(|err| RpcError::internal(format!("auth check failed: {err}")))?;
        debug!(
            session_id = ?params.and_then(|p| p.id),
            authenticated = status.authenticated,
            "claude auth check"
        );
        serde_json::to_value(status).map_err(|err| RpcError::internal(err.to_string()))
    })
    .await;

    {
        let orchestrators = orchestrators.clone();
        peer.add_method("workspaceInit", move |params| {
            let orchestrators = orchestrators.clone();
            async move { workspace_init(&orchestrators, params).await }
        })
        .await;
    }

    {
        let orchestrators = orchestrators.clone();
        peer.add_method("contextUsage", move |params| {
            let orchestrators = orchestrators.clone();
            async move { context_usage(&orchestrators, params).await }
        })
        .await;
    }

    peer.add_method("updatePermissionMode", move |params| {
        let orchestrators = orchestrators.clone();
        async move {
            let params: PermissionModeParams = parse_params(params)?;
            orchestrators
                .update_permission_mode(&params.id, params.agent_kind, &params.permission_mode)
                .await;
            Ok(Value::Null)
        }
    })
    .await;
}

async fn query(
    orchestrators: &Orchestrators,
    client: ClientHandle,
    params: Value,
) -> Result<Value, RpcError> {
    let params: QueryParams = match serde_json::from_value(params.clone()) {
        Ok(params) => params,
        Err(err) => {
            // A query is a notification; tell the client through queryError
            // when the payload at least names its session.
            if let Some(id) = params.get("id").and_then(Value::as_str) {
                let payload = QueryErrorPayload::new(
                    id,
                    agent_kind_hint(&params),
                    format!("invalid query params: {err}"),
                );
                if let Err(send_err) = client.send_error(&payload).await {
                    debug!(session_id = id, %send_err, "could not deliver queryError");
                }
            }
            return Err(RpcError::invalid_params(err));
        }
    };

    let Some(orchestrator) = orchestrators.get(params.agent_kind) else {
        warn!(session_id = %params.id, agent_kind = %params.agent_kind, "no runtime registered");
        let payload = QueryErrorPayload::new(
            &params.id,
            params.agent_kind,
            format!("agent kind {} is not available", params.agent_kind),
        );
        let _ = client.send_error(&payload).await;
        return Ok(Value::Null);
    };

    orchestrator
        .handle_query(&params.id, params.prompt, params.options, client)
        .await;
    Ok(Value::Null)
}

async fn workspace_init(orchestrators: &Orchestrators, params: Value) -> Result<Value, RpcError> {
    let params: WorkspaceInitParams = parse_params(params)?;
    let cwd = &params.options.cwd;
    let is_dir = tokio::fs::metadata(cwd)
        .await
        .is_ok_and(|meta| meta.is_dir());
    if !is_dir {
        return Err(RpcError::invalid_params(format!(
            "workspace directory {} does not exist",
            cwd.display()
        )));
    }

    let kind = params.agent_kind.unwrap_or(AgentKind::Claude);
    let session = orchestrators.registry().upsert(&params.id, kind).await;
    info!(session_id = %session.id, agent_kind = %session.agent_kind, cwd = %cwd.display(), "workspace initialized");

    Ok(json!({
        "id": session.id,
        "agentType": session.agent_kind,
        "agentKind": session.agent_kind,
        "status": session.status,
        "cwd": cwd,
    }))
}

async fn context_usage(orchestrators: &Orchestrators, params: Value) -> Result<Value, RpcError> {
    let params: ContextUsageParams = parse_params(params)?;
    let session = orchestrators
        .registry()
        .get(&params.id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("session {} not found", params.id)))?;

    let agent_session_id = session
        .agent_session_id
        .or(session.thread_id)
        .or(params.options.session_id);
    Ok(json!({
        "id": session.id,
        "agentSessionId": agent_session_id,
        "usage": session.context_usage,
    }))
}

fn agent_kind_hint(params: &Value) -> AgentKind {
    params
        .get("agentKind")
        .or_else(|| params.get("agentType"))
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or(AgentKind::Claude)
}
