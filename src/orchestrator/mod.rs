//! Query orchestration.
//!
//! One [`QueryOrchestrator`] per agent kind, bundled in [`Orchestrators`]
//! and shared by every connection.

pub mod client;
pub mod query;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

pub use client::ClientHandle;
pub use query::QueryOrchestrator;

use crate::config::{BusyPolicy, GlobalConfig};
use crate::models::session::AgentKind;
use crate::registry::SessionRegistry;
use crate::runtime::claude::ClaudeRuntime;
use crate::runtime::codex::CodexRuntime;
use crate::runtime::AgentRuntime;

/// Orchestrators keyed by agent kind, plus the registry they share.
#[derive(Debug, Clone)]
pub struct Orchestrators {
    registry: SessionRegistry,
    by_kind: HashMap<AgentKind, Arc<QueryOrchestrator>>,
}

impl Orchestrators {
    /// Build one orchestrator per runtime. A later runtime of the same kind
    /// replaces an earlier one.
    #[must_use]
    pub fn new(
        registry: SessionRegistry,
        runtimes: Vec<Arc<dyn AgentRuntime>>,
        busy_policy: BusyPolicy,
    ) -> Self {
        let by_kind = runtimes
            .into_iter()
            .map(|runtime| {
                let orchestrator = QueryOrchestrator::new(runtime, registry.clone(), busy_policy);
                (orchestrator.kind(), orchestrator)
            })
            .collect();
        Self { registry, by_kind }
    }

    /// Orchestrators for the Claude and Codex CLIs described by `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig, registry: SessionRegistry) -> Self {
        let grace = config.timeouts.cancel_grace();
        let runtimes: Vec<Arc<dyn AgentRuntime>> = vec![
            Arc::new(ClaudeRuntime::new(
                config.runtimes.claude.clone(),
                grace,
                config.max_line_bytes,
            )),
            Arc::new(CodexRuntime::new(
                config.runtimes.codex.clone(),
                grace,
                config.max_line_bytes,
            )),
        ];
        Self::new(registry, runtimes, config.busy_policy)
    }

    /// Shared session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Orchestrator for `kind`, if a runtime was registered for it.
    #[must_use]
    pub fn get(&self, kind: AgentKind) -> Option<&Arc<QueryOrchestrator>> {
        self.by_kind.get(&kind)
    }

    /// Cancel the running query of `session_id`.
    ///
    /// The agent kind comes from the registry, falling back to `kind` for
    /// sessions it does not know. Returns whether a running query was
    /// cancelled.
    pub async fn cancel(&self, session_id: &str, kind: Option<AgentKind>) -> bool {
        let Some(orchestrator) = self.resolve(session_id, kind).await else {
            debug!(session_id, "cancel for unknown session ignored");
            return false;
        };
        orchestrator.handle_cancel(session_id).await
    }

    /// Forward a permission mode change to the session's orchestrator.
    pub async fn update_permission_mode(
        &self,
        session_id: &str,
        kind: Option<AgentKind>,
        mode: &str,
    ) {
        match self.resolve(session_id, kind).await {
            Some(orchestrator) => {
                orchestrator
                    .handle_permission_mode_update(session_id, mode)
                    .await;
            }
            None => debug!(session_id, mode, "permission mode update for unknown session ignored"),
        }
    }

    /// Cancel every running query of every kind.
    pub async fn cancel_all(&self) -> usize {
        let mut total = 0;
        for orchestrator in self.by_kind.values() {
            total += orchestrator.cancel_all().await;
        }
        total
    }

    async fn resolve(
        &self,
        session_id: &str,
        kind: Option<AgentKind>,
    ) -> Option<&Arc<QueryOrchestrator>> {
        // The registry wins: a session never changes kind.
        let kind = match self.registry.get(session_id).await {
            Some(session) => session.agent_kind,
            None => kind?,
        };
        self.get(kind)
    }
}
