//! Process-wide session registry.
//!
//! The single source of truth for session existence and status. One
//! [`SessionRegistry`] is created at startup and shared (cheaply cloned) by
//! every connection and every orchestrator, so a session started on one
//! connection is visible to all others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::session::{AgentKind, Session, SessionStatus};
use crate::{AppError, Result};

/// Result of [`SessionRegistry::begin_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum BeginQuery {
    /// The session moved to `running`; the returned snapshot is current.
    Started(Session),
    /// The session already has a query in flight.
    Busy(Session),
}

/// Shared, mutex-guarded map of session id → [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a session, if it exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Snapshot of every session.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Return the existing session, or create an idle one bound to `agent_kind`.
    ///
    /// An existing session keeps its original agent kind.
    pub async fn upsert(&self, id: &str, agent_kind: AgentKind) -> Session {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(id.to_owned())
            .or_insert_with(|| {
                debug!(session_id = id, %agent_kind, "registry: session created");
                Session::new(id, agent_kind)
            })
            .clone()
    }

    /// Update session status, respecting the state machine.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the session does not exist.
    /// - `AppError::Session` if the transition is not permitted.
    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let current = sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;

        if !current.can_transition_to(status) {
            return Err(AppError::Session(format!(
                "invalid status transition for {id}: {:?} -> {status:?}",
                current.status
            )));
        }

        current.status = status;
        current.updated_at = Utc::now();
        debug!(session_id = id, ?status, "registry: status updated");
        Ok(current.clone())
    }

    /// Atomically create-or-fetch a session and move it to `running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if the session belongs to a different
    /// agent kind.
    pub async fn begin_query(&self, id: &str, agent_kind: AgentKind) -> Result<BeginQuery> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(id.to_owned())
            .or_insert_with(|| Session::new(id, agent_kind));

        if session.agent_kind != agent_kind {
            return Err(AppError::Session(format!(
                "session {id} belongs to agent kind {}",
                session.agent_kind
            )));
        }

        if session.status == SessionStatus::Running {
            return Ok(BeginQuery::Busy(session.clone()));
        }

        session.status = SessionStatus::Running;
        session.updated_at = Utc::now();
        Ok(BeginQuery::Started(session.clone()))
    }

    /// Record the permission mode requested for a session.
    ///
    /// Returns `false` when the session does not exist.
    pub async fn set_permission_mode(&self, id: &str, mode: &str) -> bool {
        self.update(id, |session| session.permission_mode = Some(mode.to_owned()))
            .await
    }

    /// Record the runtime's resume handles for a session.
    pub async fn record_agent_ids(
        &self,
        id: &str,
        agent_session_id: Option<&str>,
        thread_id: Option<&str>,
    ) -> bool {
        self.update(id, |session| {
            if let Some(value) = agent_session_id {
                session.agent_session_id = Some(value.to_owned());
            }
            if let Some(value) = thread_id {
                session.thread_id = Some(value.to_owned());
            }
        })
        .await
    }

    /// Record the latest token usage reported for a session.
    pub async fn record_context_usage(&self, id: &str, usage: Value) -> bool {
        self.update(id, |session| session.context_usage = Some(usage))
            .await
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut Session)) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(id) {
            Some(session) => {
                apply(session);
                session.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}
