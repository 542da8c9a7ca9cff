//! Per-agent-kind query orchestration.
//!
//! A [`QueryOrchestrator`] owns the in-flight queries of one agent kind.
//! Each query runs on its own detached task, which is the single producer
//! of that session's notifications, so per-session ordering holds while
//! distinct sessions interleave freely.
//!
//! Lock order: orchestrator state, then registry. The state lock is never
//! held across a reverse request or a notification send.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::BusyPolicy;
use crate::models::inbound::QueryOptions;
use crate::models::outbound::{MessagePayload, PlanModePayload, QueryErrorPayload, MESSAGE};
use crate::models::reverse::{
    AskUserQuestionParams, DiffOutcome, ExitPlanModeParams, GetDiffParams, PlanDecision,
    QuestionOutcome,
};
use crate::models::session::{AgentKind, Session, SessionStatus};
use crate::orchestrator::client::ClientHandle;
use crate::registry::{BeginQuery, SessionRegistry};
use crate::runtime::{AgentMessage, AgentRuntime, QueryRequest, RuntimeEvent};

/// How a query task ended.
#[derive(Debug, Clone, PartialEq)]
enum QueryOutcome {
    Done,
    Failed { error: String, data: Option<Value> },
    Cancelled,
    Disconnected,
}

struct ActiveQuery {
    generation: u64,
    cancel: CancellationToken,
    permission_mode: watch::Sender<Option<String>>,
}

struct PendingQuery {
    prompt: String,
    options: QueryOptions,
    client: ClientHandle,
}

/// A `queryError` held back until the state lock is released.
struct DeferredError {
    client: ClientHandle,
    payload: QueryErrorPayload,
}

#[derive(Default)]
struct OrchestratorState {
    active: HashMap<String, ActiveQuery>,
    queued: HashMap<String, VecDeque<PendingQuery>>,
}

/// Drives queries of one agent kind against its runtime.
pub struct QueryOrchestrator {
    kind: AgentKind,
    runtime: Arc<dyn AgentRuntime>,
    registry: SessionRegistry,
    busy_policy: BusyPolicy,
    state: Mutex<OrchestratorState>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("kind", &self.kind)
            .field("busy_policy", &self.busy_policy)
            .finish_non_exhaustive()
    }
}

impl QueryOrchestrator {
    /// Create an orchestrator for `runtime.kind()`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        registry: SessionRegistry,
        busy_policy: BusyPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: runtime.kind(),
            runtime,
            registry,
            busy_policy,
            state: Mutex::new(OrchestratorState::default()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Agent kind served.
    #[must_use]
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Start (or queue, or reject) a query. Returns without waiting for the
    /// agent.
    pub async fn handle_query(
        self: &Arc<Self>,
        session_id: &str,
        prompt: String,
        options: QueryOptions,
        client: ClientHandle,
    ) {
        let mut state = self.state.lock().await;

        match self.registry.begin_query(session_id, self.kind).await {
            Ok(BeginQuery::Started(session)) => {
                self.launch(&mut state, session, prompt, options, client, Vec::new());
            }
            Ok(BeginQuery::Busy(_)) => match self.busy_policy {
                BusyPolicy::Reject => {
                    drop(state);
                    info!(session_id, agent_kind = %self.kind, "query rejected: session busy");
                    let error = format!("session {session_id} already has a query in flight");
                    self.report_error(&client, session_id, error, None).await;
                }
                BusyPolicy::Queue => {
                    let queue = state.queued.entry(session_id.to_owned()).or_default();
                    queue.push_back(PendingQuery {
                        prompt,
                        options,
                        client,
                    });
                    info!(session_id, agent_kind = %self.kind, depth = queue.len(), "query queued behind running query");
                }
            },
            Err(err) => {
                drop(state);
                warn!(session_id, agent_kind = %self.kind, %err, "query rejected");
                self.report_error(&client, session_id, err.to_string(), None)
                    .await;
            }
        }
    }

    /// Cancel the running query of `session_id`, if any.
    ///
    /// Returns whether a running query was cancelled. Unknown, idle and
    /// finished sessions are a silent no-op.
    pub async fn handle_cancel(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let dropped = state.queued.remove(session_id).map_or(0, |q| q.len());

        let Some(active) = state.active.remove(session_id) else {
            debug!(session_id, agent_kind = %self.kind, "cancel: no running query");
            return false;
        };
        active.cancel.cancel();

        match self
            .registry
            .set_status(session_id, SessionStatus::Cancelled)
            .await
        {
            Ok(_) => info!(session_id, agent_kind = %self.kind, dropped, "query cancelled"),
            Err(err) => warn!(session_id, %err, "cancel: could not mark session cancelled"),
        }
        true
    }

    /// Store `mode` on the session and forward it to the running query.
    pub async fn handle_permission_mode_update(&self, session_id: &str, mode: &str) {
        let state = self.state.lock().await;
        if !self.registry.set_permission_mode(session_id, mode).await {
            debug!(session_id, mode, "permission mode update for unknown session ignored");
            return;
        }

        if let Some(active) = state.active.get(session_id) {
            // No receiver means the runtime does not follow mode changes.
            let _ = active.permission_mode.send(Some(mode.to_owned()));
            info!(session_id, mode, "permission mode forwarded to running query");
        } else {
            debug!(session_id, mode, "permission mode stored for next query");
        }
    }

    /// Cancel every running query and drop every queued one.
    pub async fn cancel_all(&self) -> usize {
        let mut state = self.state.lock().await;
        state.queued.clear();

        let active: Vec<(String, ActiveQuery)> = state.active.drain().collect();
        for (session_id, query) in &active {
            query.cancel.cancel();
            if let Err(err) = self
                .registry
                .set_status(session_id, SessionStatus::Cancelled)
                .await
            {
                debug!(session_id = %session_id, %err, "cancel_all: status update skipped");
            }
        }
        if !active.is_empty() {
            info!(agent_kind = %self.kind, count = active.len(), "cancelled running queries");
        }
        active.len()
    }

    /// Number of queries in flight.
    pub async fn running(&self) -> usize {
        self.state.lock().await.active.len()
    }

    fn launch(
        self: &Arc<Self>,
        state: &mut OrchestratorState,
        session: Session,
        prompt: String,
        options: QueryOptions,
        client: ClientHandle,
        preamble: Vec<DeferredError>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let mode = options
            .permission_mode
            .clone()
            .or_else(|| session.permission_mode.clone());
        let (mode_tx, mode_rx) = watch::channel(mode);

        state.active.insert(
            session.id.clone(),
            ActiveQuery {
                generation,
                cancel: cancel.clone(),
                permission_mode: mode_tx,
            },
        );

        let resume = options
            .resume
            .clone()
            .or_else(|| session.resume_token().map(str::to_owned));
        let request = QueryRequest {
            session_id: session.id.clone(),
            prompt,
            options,
            resume,
            permission_mode: mode_rx,
            cancel,
        };

        info!(
            session_id = %session.id,
            agent_kind = %self.kind,
            generation,
            connection_id = %client.connection_id(),
            "query started"
        );

        let span = info_span!("query", session_id = %session.id, agent_kind = %self.kind);
        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                let session_id = request.session_id.clone();
                // Errors of the query this one was queued behind go out first.
                this.deliver(preamble).await;
                let outcome = this.drive(request, &client).await;
                this.finish(&session_id, generation, outcome, &client).await;
            }
            .instrument(span),
        );
    }

    async fn drive(&self, request: QueryRequest, client: &ClientHandle) -> QueryOutcome {
        let session_id = request.session_id.clone();
        let cancel = request.cancel.clone();

        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => return QueryOutcome::Cancelled,
            started = self.runtime.start_query(request) => started,
        };
        let mut events: mpsc::Receiver<RuntimeEvent> = match started {
            Ok(events) => events,
            Err(err) => {
                return QueryOutcome::Failed {
                    error: err.to_string(),
                    data: None,
                }
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return QueryOutcome::Cancelled,
                () = client.closed() => return QueryOutcome::Disconnected,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                return QueryOutcome::Failed {
                    error: "agent runtime ended without a result".into(),
                    data: None,
                };
            };

            match event {
                RuntimeEvent::Message(msg) => {
                    self.record(&session_id, &msg).await;
                    let payload = message_payload(&session_id, self.kind, msg);
                    if client.send_message(&payload).await.is_err() {
                        return QueryOutcome::Disconnected;
                    }
                }
                RuntimeEvent::PlanModeEntered => {
                    let payload = PlanModePayload {
                        id: session_id.clone(),
                        agent: self.kind.into(),
                    };
                    if client.send_plan_mode(&payload).await.is_err() {
                        return QueryOutcome::Disconnected;
                    }
                }
                RuntimeEvent::PlanApprovalNeeded { tool_input, reply } => {
                    let params = ExitPlanModeParams {
                        session_id: session_id.clone(),
                        tool_input,
                    };
                    let decision = tokio::select! {
                        biased;
                        () = cancel.cancelled() => PlanDecision::declined(),
                        decision = client.request_plan_approval(&params) => decision,
                    };
                    let _ = reply.send(decision);
                }
                RuntimeEvent::QuestionNeeded { questions, reply } => {
                    let params = AskUserQuestionParams {
                        session_id: session_id.clone(),
                        questions,
                    };
                    let outcome = tokio::select! {
                        biased;
                        () = cancel.cancelled() => QuestionOutcome::Declined,
                        outcome = client.request_answers(&params) => outcome,
                    };
                    let _ = reply.send(outcome);
                }
                RuntimeEvent::DiffNeeded { file, stat, reply } => {
                    let params = GetDiffParams {
                        session_id: session_id.clone(),
                        file,
                        stat,
                    };
                    let outcome = tokio::select! {
                        biased;
                        () = cancel.cancelled() => DiffOutcome::Unavailable("query cancelled".into()),
                        outcome = client.request_diff(&params) => outcome,
                    };
                    let _ = reply.send(outcome);
                }
                RuntimeEvent::Completed => return QueryOutcome::Done,
                RuntimeEvent::Failed { error, data } => {
                    return QueryOutcome::Failed { error, data }
                }
            }

            if client.is_closed() {
                return QueryOutcome::Disconnected;
            }
        }
    }

    async fn finish(
        self: &Arc<Self>,
        session_id: &str,
        generation: u64,
        outcome: QueryOutcome,
        client: &ClientHandle,
    ) {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock().await;

            let current = state
                .active
                .get(session_id)
                .is_some_and(|active| active.generation == generation);
            if !current {
                // Cancelled: handle_cancel already removed the entry and set the status.
                debug!(session_id, generation, ?outcome, "query task ended after cancellation");
                return;
            }
            let Some(active) = state.active.remove(session_id) else {
                return;
            };

            match outcome {
                QueryOutcome::Done => {
                    self.set_status(session_id, SessionStatus::Done).await;
                    info!(session_id, agent_kind = %self.kind, "query completed");
                }
                QueryOutcome::Failed { error, data } => {
                    self.set_status(session_id, SessionStatus::Error).await;
                    warn!(session_id, agent_kind = %self.kind, %error, "query failed");
                    deferred.push(self.error_report(client, session_id, error, data));
                }
                QueryOutcome::Cancelled => {
                    self.set_status(session_id, SessionStatus::Cancelled).await;
                }
                QueryOutcome::Disconnected => {
                    active.cancel.cancel();
                    self.set_status(session_id, SessionStatus::Error).await;
                    let dropped = state.queued.remove(session_id).map_or(0, |q| q.len());
                    warn!(
                        session_id,
                        agent_kind = %self.kind,
                        connection_id = %client.connection_id(),
                        dropped,
                        "client connection gone, query abandoned"
                    );
                }
            }

            self.start_next(&mut state, session_id, &mut deferred).await;
        }
        self.deliver(deferred).await;
    }

    /// Launch the next queued query of `session_id`, if any. Reports that
    /// must precede its output move into the launched task.
    async fn start_next(
        self: &Arc<Self>,
        state: &mut OrchestratorState,
        session_id: &str,
        deferred: &mut Vec<DeferredError>,
    ) {
        let Some(next) = state
            .queued
            .get_mut(session_id)
            .and_then(VecDeque::pop_front)
        else {
            return;
        };
        if state.queued.get(session_id).is_some_and(VecDeque::is_empty) {
            state.queued.remove(session_id);
        }

        match self.registry.begin_query(session_id, self.kind).await {
            Ok(BeginQuery::Started(session)) => {
                let preamble = std::mem::take(deferred);
                self.launch(state, session, next.prompt, next.options, next.client, preamble);
            }
            Ok(BeginQuery::Busy(_)) => {
                warn!(session_id, "queued query found session already running, dropping it");
            }
            Err(err) => {
                warn!(session_id, %err, "queued query could not start");
                deferred.push(self.error_report(&next.client, session_id, err.to_string(), None));
            }
        }
    }

    async fn record(&self, session_id: &str, msg: &AgentMessage) {
        if msg.agent_session_id.is_some() || msg.thread_id.is_some() {
            self.registry
                .record_agent_ids(
                    session_id,
                    msg.agent_session_id.as_deref(),
                    msg.thread_id.as_deref(),
                )
                .await;
        }
        if let Some(usage) = &msg.usage {
            self.registry
                .record_context_usage(session_id, usage.clone())
                .await;
        }
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Err(err) = self.registry.set_status(session_id, status).await {
            warn!(session_id, ?status, %err, "session status update rejected");
        }
    }

    async fn report_error(
        &self,
        client: &ClientHandle,
        session_id: &str,
        error: String,
        data: Option<Value>,
    ) {
        self.deliver(vec![self.error_report(client, session_id, error, data)])
            .await;
    }

    fn error_report(
        &self,
        client: &ClientHandle,
        session_id: &str,
        error: String,
        data: Option<Value>,
    ) -> DeferredError {
        let mut payload = QueryErrorPayload::new(session_id, self.kind, error);
        payload.data = data;
        DeferredError {
            client: client.clone(),
            payload,
        }
    }

    async fn deliver(&self, reports: Vec<DeferredError>) {
        for report in reports {
            if let Err(err) = report.client.send_error(&report.payload).await {
                debug!(session_id = %report.payload.id, %err, "could not deliver queryError");
            }
        }
    }
}

fn message_payload(session_id: &str, agent_kind: AgentKind, msg: AgentMessage) -> MessagePayload {
    MessagePayload {
        id: session_id.to_owned(),
        kind: MESSAGE,
        agent: agent_kind.into(),
        data: msg.data,
        text: msg.text,
        text_delta: msg.text_delta,
        is_final: msg.is_final.then_some(true),
        tool_summary: msg.tool_summary,
        thread_id: msg.thread_id,
        agent_session_id: msg.agent_session_id,
    }
}
