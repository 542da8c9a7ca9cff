//! Integration tests for query orchestration through the sidecar method table.
//!
//! Validates:
//! - a query streams messages and ends in `done` or a `queryError`
//! - plan approval, questions and diff requests round-trip through the client
//! - distinct sessions interleave while each keeps its own order
//! - cancel is a silent no-op for unknown sessions and stops running queries
//! - busy sessions reject or queue according to the policy
//! - permission mode updates reach the running query
//! - a client disconnect abandons the query
//! - `workspaceInit`, `contextUsage` and `claudeAuth` answer once per request
//! - a client that stops reading never stalls other connections

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use agent_sidecar::config::BusyPolicy;
use agent_sidecar::ipc::methods;
use agent_sidecar::models::reverse::{DiffOutcome, PlanDecision, QuestionOutcome, UserQuestion};
use agent_sidecar::models::session::{AgentKind, SessionStatus};
use agent_sidecar::orchestrator::ClientHandle;
use agent_sidecar::rpc::codec::MAX_LINE_BYTES;
use agent_sidecar::rpc::frame::{INVALID_PARAMS, SESSION_NOT_FOUND};
use agent_sidecar::rpc::RpcPeer;
use agent_sidecar::runtime::AgentMessage;

use super::test_helpers::{
    connect_sidecar, is_note, orchestrators, query_frame, text, wait_for_status, Recorded,
    ScriptedRuntime, Step,
};

const SILENCE: Duration = Duration::from_millis(150);

fn deltas(frames: &[Value], session: &str) -> Vec<String> {
    frames
        .iter()
        .filter(|f| is_note(f, "message", session))
        .filter_map(|f| f["params"]["textDelta"].as_str().map(str::to_owned))
        .collect()
}

// ── Query lifecycle ─────────────────────────────────────────────────────────

/// Messages stream to the client, then the session is `done`.
#[tokio::test]
async fn query_streams_messages_then_done() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![
            text("Looking."),
            Step::Message(AgentMessage {
                data: json!({ "type": "result" }),
                is_final: true,
                agent_session_id: Some("conv-1".into()),
                usage: Some(json!({ "input_tokens": 3 })),
                ..AgentMessage::default()
            }),
            Step::Complete,
        ]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "hi")).await;

    let first = client.recv().await;
    assert!(is_note(&first, "message", "s1"), "got {first}");
    assert_eq!(first["jsonrpc"], "2.0");
    assert_eq!(first["params"]["type"], "message");
    assert_eq!(first["params"]["agentKind"], "claude");
    assert_eq!(first["params"]["agentType"], "claude");
    assert_eq!(first["params"]["textDelta"], "Looking.");

    let last = client.recv().await;
    assert_eq!(last["params"]["isFinal"], true);
    assert_eq!(last["params"]["agentSessionId"], "conv-1");

    wait_for_status(&orch, "s1", "done").await;
    client.expect_silence(SILENCE).await;

    let session = orch.registry().get("s1").await.expect("session");
    assert_eq!(session.agent_session_id.as_deref(), Some("conv-1"));
    assert_eq!(session.context_usage, Some(json!({ "input_tokens": 3 })));
    assert_eq!(claude.started()[0].prompt, "hi");
}

/// A failing runtime ends in `error` with a `queryError` carrying the detail.
#[tokio::test]
async fn runtime_failure_reports_query_error() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![Step::Fail("model overloaded".into())]],
    );
    let orch = orchestrators(&[claude], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "hi")).await;

    let error = client.recv().await;
    assert!(is_note(&error, "queryError", "s1"), "got {error}");
    assert_eq!(error["params"]["type"], "error");
    assert_eq!(error["params"]["error"], "model overloaded");
    assert_eq!(error["params"]["data"], json!({ "scripted": true }));
    wait_for_status(&orch, "s1", "error").await;
}

/// A runtime stream that closes without a result is a failure.
#[tokio::test]
async fn stream_without_result_is_failure() {
    let codex = ScriptedRuntime::new(AgentKind::Codex, vec![vec![text("partial")]]);
    let orch = orchestrators(&[codex], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "codex", "hi")).await;

    let frames = client.recv_until(|f| is_note(f, "queryError", "s1")).await;
    assert_eq!(deltas(&frames, "s1"), vec!["partial".to_owned()]);
    assert_eq!(
        frames.last().expect("error frame")["params"]["error"],
        "agent runtime ended without a result"
    );
    wait_for_status(&orch, "s1", "error").await;
}

/// A finished session runs again and resumes from its stored conversation id.
#[tokio::test]
async fn second_query_resumes_conversation() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![
            vec![
                Step::Message(AgentMessage {
                    data: json!({ "type": "system" }),
                    agent_session_id: Some("conv-7".into()),
                    ..AgentMessage::default()
                }),
                Step::Complete,
            ],
            vec![Step::Complete],
        ],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "first")).await;
    client.recv().await;
    wait_for_status(&orch, "s1", "done").await;

    client.send(query_frame("s1", "claude", "second")).await;
    wait_for_status(&orch, "s1", "done").await;

    let started = claude.started();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0].resume, None);
    assert_eq!(started[1].resume.as_deref(), Some("conv-7"));
}

/// Invalid query params naming a session produce a `queryError`.
#[tokio::test]
async fn invalid_query_params_report_error() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Claude, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client
        .send(json!({ "method": "query", "params": { "id": "s1", "agentKind": "codex" } }))
        .await;

    let error = client.recv().await;
    assert!(is_note(&error, "queryError", "s1"), "got {error}");
    assert_eq!(error["params"]["agentKind"], "codex");
    assert_eq!(error["params"]["agentType"], "codex");
    assert!(error["params"]["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("invalid query params")));
    assert!(orch.registry().get("s1").await.is_none());
}

/// A query for a kind without a runtime is reported, not dropped.
#[tokio::test]
async fn unavailable_kind_reports_error() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Claude, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "codex", "hi")).await;

    let error = client.recv().await;
    assert_eq!(error["params"]["error"], "agent kind codex is not available");
}

/// A session bound to one kind rejects queries for the other.
#[tokio::test]
async fn kind_mismatch_is_rejected() {
    let claude = ScriptedRuntime::new(AgentKind::Claude, vec![]);
    let codex = ScriptedRuntime::new(AgentKind::Codex, vec![]);
    let orch = orchestrators(&[claude, Arc::clone(&codex)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "hi")).await;
    wait_for_status(&orch, "s1", "done").await;

    client.send(query_frame("s1", "codex", "hi")).await;

    let error = client.recv().await;
    assert!(is_note(&error, "queryError", "s1"), "got {error}");
    assert!(codex.started().is_empty());
}

// ── Reverse requests ────────────────────────────────────────────────────────

/// `exitPlanMode` approval reaches the runtime and the query continues.
#[tokio::test]
async fn plan_approval_resumes_session() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![
            Step::PlanApproval(json!({ "plan": "1. edit" })),
            text("Implementing."),
            Step::Complete,
        ]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "plan it")).await;

    let request = client.recv().await;
    assert_eq!(request["method"], "exitPlanMode");
    assert_eq!(request["params"], json!({ "sessionId": "s1", "toolInput": { "plan": "1. edit" } }));
    client
        .send(json!({ "id": request["id"], "result": { "approved": true, "turnId": 3 } }))
        .await;

    let message = client.recv().await;
    assert_eq!(message["params"]["textDelta"], "Implementing.");
    wait_for_status(&orch, "s1", "done").await;
    assert_eq!(
        claude.recorded(),
        vec![Recorded::Plan(PlanDecision {
            approved: true,
            turn_id: Some(3)
        })]
    );
}

/// An error reply to `exitPlanMode` declines the plan.
#[tokio::test]
async fn plan_error_reply_declines() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![Step::PlanApproval(json!({})), Step::Complete]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "plan it")).await;
    let request = client.recv().await;
    client
        .send(json!({ "id": request["id"], "error": { "code": -32000, "message": "dialog closed" } }))
        .await;

    let recorded = claude.wait_recorded(1).await;
    assert_eq!(recorded, vec![Recorded::Plan(PlanDecision::declined())]);
}

/// An unanswered reverse request times out as declined.
#[tokio::test]
async fn reverse_request_timeout_declines() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![
            Step::Question(vec![UserQuestion {
                question: "Keep?".into(),
                options: vec!["Yes".into()],
            }]),
            Step::Complete,
        ]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, Some(Duration::from_millis(100))).await;

    client.send(query_frame("s1", "claude", "ask")).await;
    let request = client.recv().await;
    assert_eq!(request["method"], "askUserQuestion");

    let recorded = claude.wait_recorded(1).await;
    assert_eq!(recorded, vec![Recorded::Question(QuestionOutcome::Declined)]);
    wait_for_status(&orch, "s1", "done").await;
}

/// Answers come back in order; the legacy sentinel declines.
#[tokio::test]
async fn questions_are_answered_or_declined() {
    let questions = vec![
        UserQuestion {
            question: "Keep the old API?".into(),
            options: vec!["Keep".into(), "Drop".into()],
        },
        UserQuestion {
            question: "Add tests?".into(),
            options: vec!["Yes".into(), "No".into()],
        },
    ];
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![
            Step::Question(questions.clone()),
            Step::Question(questions),
            Step::Complete,
        ]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "ask")).await;

    let first = client.recv().await;
    assert_eq!(first["method"], "askUserQuestion");
    assert_eq!(first["params"]["sessionId"], "s1");
    assert_eq!(first["params"]["questions"][1]["question"], "Add tests?");
    assert_eq!(first["params"]["questions"][0]["options"], json!(["Keep", "Drop"]));
    client
        .send(json!({ "id": first["id"], "result": { "answers": ["Keep", "Yes"] } }))
        .await;

    let second = client.recv().await;
    client
        .send(json!({ "id": second["id"], "result": { "answers": ["Keep", "USER_CANCELLED"] } }))
        .await;

    wait_for_status(&orch, "s1", "done").await;
    assert_eq!(
        claude.recorded(),
        vec![
            Recorded::Question(QuestionOutcome::Answered(vec!["Keep".into(), "Yes".into()])),
            Recorded::Question(QuestionOutcome::Declined),
        ]
    );
}

/// `getDiff` carries its filters and returns the client's diff or error.
#[tokio::test]
async fn diff_round_trip() {
    let codex = ScriptedRuntime::new(
        AgentKind::Codex,
        vec![vec![
            Step::Diff {
                file: Some("src/lib.rs".into()),
                stat: Some(true),
            },
            Step::Diff {
                file: None,
                stat: None,
            },
            Step::Complete,
        ]],
    );
    let orch = orchestrators(&[Arc::clone(&codex)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "codex", "review")).await;

    let first = client.recv().await;
    assert_eq!(first["method"], "getDiff");
    assert_eq!(first["params"], json!({ "sessionId": "s1", "file": "src/lib.rs", "stat": true }));
    client
        .send(json!({ "id": first["id"], "result": { "diff": " src/lib.rs | 2 +-" } }))
        .await;

    let second = client.recv().await;
    assert_eq!(second["params"], json!({ "sessionId": "s1" }));
    client
        .send(json!({ "id": second["id"], "result": { "error": "not a git repository" } }))
        .await;

    wait_for_status(&orch, "s1", "done").await;
    assert_eq!(
        codex.recorded(),
        vec![
            Recorded::Diff(DiffOutcome::Diff(" src/lib.rs | 2 +-".into())),
            Recorded::Diff(DiffOutcome::Unavailable("not a git repository".into())),
        ]
    );
}

/// Entering plan mode is announced to the client.
#[tokio::test]
async fn plan_mode_is_announced() {
    let claude = ScriptedRuntime::new(AgentKind::Claude, vec![vec![Step::PlanMode, Step::Complete]]);
    let orch = orchestrators(&[claude], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "plan")).await;

    let note = client.recv().await;
    assert!(is_note(&note, "enterPlanModeNotification", "s1"), "got {note}");
    assert_eq!(note["params"]["agentKind"], "claude");
}

// ── Concurrency ─────────────────────────────────────────────────────────────

/// Two sessions interleave; each keeps its own message order.
#[tokio::test]
async fn sessions_interleave_in_order() {
    let gate = Arc::new(Notify::new());
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![
            vec![
                text("a1"),
                Step::WaitFor(Arc::clone(&gate)),
                text("a2"),
                text("a3"),
                Step::Complete,
            ],
            vec![text("b1"), text("b2"), Step::Complete],
        ],
    );
    let orch = orchestrators(&[claude], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("a", "claude", "first")).await;
    let a1 = client.recv().await;
    assert_eq!(a1["params"]["textDelta"], "a1");

    // Session "a" is parked; "b" must still make progress.
    client.send(query_frame("b", "claude", "second")).await;
    let frames = client
        .recv_until(|f| is_note(f, "message", "b") && f["params"]["textDelta"] == "b2")
        .await;
    assert_eq!(deltas(&frames, "b"), vec!["b1".to_owned(), "b2".to_owned()]);
    wait_for_status(&orch, "b", "done").await;

    gate.notify_one();
    let frames = client
        .recv_until(|f| is_note(f, "message", "a") && f["params"]["textDelta"] == "a3")
        .await;
    assert_eq!(deltas(&frames, "a"), vec!["a2".to_owned(), "a3".to_owned()]);
    wait_for_status(&orch, "a", "done").await;
}

/// A busy session rejects a second query under the default policy.
#[tokio::test]
async fn busy_session_rejects() {
    let claude = ScriptedRuntime::new(AgentKind::Claude, vec![vec![Step::WaitForCancel]]);
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "first")).await;
    wait_for_status(&orch, "s1", "running").await;
    client.send(query_frame("s1", "claude", "second")).await;

    let error = client.recv().await;
    assert!(is_note(&error, "queryError", "s1"), "got {error}");
    assert_eq!(error["params"]["error"], "session s1 already has a query in flight");
    assert_eq!(claude.started().len(), 1);

    let cancelled = client.call("c1", "cancel", json!({ "id": "s1" })).await;
    assert_eq!(cancelled["result"], json!({ "cancelled": true }));
}

/// Under the queue policy a second query runs after the first ends.
#[tokio::test]
async fn busy_session_queues() {
    let gate = Arc::new(Notify::new());
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![
            vec![Step::WaitFor(Arc::clone(&gate)), Step::Complete],
            vec![text("second ran"), Step::Complete],
        ],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Queue);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "first")).await;
    wait_for_status(&orch, "s1", "running").await;
    client.send(query_frame("s1", "claude", "second")).await;
    client.expect_silence(SILENCE).await;
    assert_eq!(claude.started().len(), 1);

    gate.notify_one();

    let message = client.recv().await;
    assert_eq!(message["params"]["textDelta"], "second ran");
    wait_for_status(&orch, "s1", "done").await;
    let prompts: Vec<String> = claude.started().into_iter().map(|q| q.prompt).collect();
    assert_eq!(prompts, vec!["first".to_owned(), "second".to_owned()]);
}

/// A failed query's `queryError` precedes the output of the query queued behind it.
#[tokio::test]
async fn queued_query_follows_failure_report() {
    let gate = Arc::new(Notify::new());
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![
            vec![Step::WaitFor(Arc::clone(&gate)), Step::Fail("first failed".into())],
            vec![text("second ran"), Step::Complete],
        ],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Queue);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "first")).await;
    wait_for_status(&orch, "s1", "running").await;
    client.send(query_frame("s1", "claude", "second")).await;
    client.expect_silence(SILENCE).await;

    gate.notify_one();

    let error = client.recv().await;
    assert!(is_note(&error, "queryError", "s1"), "got {error}");
    assert_eq!(error["params"]["error"], "first failed");
    let message = client.recv().await;
    assert_eq!(message["params"]["textDelta"], "second ran");
    wait_for_status(&orch, "s1", "done").await;
}

/// A client that stops reading does not stall other connections.
#[tokio::test]
async fn stalled_client_does_not_block_other_connections() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        (0..6).map(|_| vec![Step::Fail("boom".into())]).collect(),
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);

    // Connection whose client never reads: tiny pipe, one-slot queue.
    let (stalled_end, server_end) = tokio::io::duplex(64);
    let (server_read, server_write) = tokio::io::split(server_end);
    let stalled = RpcPeer::with_limits("stalled", server_write, 1, MAX_LINE_BYTES);
    methods::register(&stalled, orch.clone(), ClientHandle::new(Arc::clone(&stalled), None)).await;
    {
        let stalled = Arc::clone(&stalled);
        tokio::spawn(async move { stalled.serve(server_read).await });
    }
    let (_unread, mut stalled_writer) = tokio::io::split(stalled_end);
    for n in 0..6 {
        let mut line = query_frame(&format!("s{n}"), "claude", "fail").to_string();
        line.push('\n');
        stalled_writer.write_all(line.as_bytes()).await.expect("write query");
    }
    for n in 0..6 {
        wait_for_status(&orch, &format!("s{n}"), "error").await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut other, _peer) = connect_sidecar(&orch, None).await;
    let response = other.call("r1", "cancel", json!({ "id": "s0" })).await;
    assert_eq!(response["result"]["cancelled"], false);

    other.send(query_frame("fresh", "claude", "hi")).await;
    wait_for_status(&orch, "fresh", "done").await;
}

// ── Cancel ──────────────────────────────────────────────────────────────────

/// Cancelling an unknown session answers `cancelled: false` and emits nothing else.
#[tokio::test]
async fn cancel_unknown_session_is_noop() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Claude, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    let response = client
        .call("r1", "cancel", json!({ "id": "nonexistent" }))
        .await;

    assert_eq!(response, json!({ "jsonrpc": "2.0", "id": "r1", "result": { "cancelled": false } }));
    client.expect_silence(SILENCE).await;
    assert!(orch.registry().get("nonexistent").await.is_none());
}

/// Cancelling an idle session is also a no-op.
#[tokio::test]
async fn cancel_idle_session_is_noop() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Claude, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;
    orch.registry().upsert("s1", AgentKind::Claude).await;

    let response = client.call("r1", "cancel", json!({ "id": "s1" })).await;

    assert_eq!(response["result"], json!({ "cancelled": false }));
    let session = orch.registry().get("s1").await.expect("session");
    assert_eq!(session.status, SessionStatus::Idle);
}

/// Cancelling a running query stops it silently and marks it `cancelled`.
#[tokio::test]
async fn cancel_running_query() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![text("working"), Step::WaitForCancel]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "long task")).await;
    client.recv().await;

    let response = client
        .call("r1", "cancel", json!({ "id": "s1", "agentKind": "claude" }))
        .await;
    assert_eq!(response["result"], json!({ "cancelled": true }));

    claude.wait_recorded(1).await;
    assert_eq!(claude.recorded(), vec![Recorded::Cancelled]);
    wait_for_status(&orch, "s1", "cancelled").await;
    client.expect_silence(SILENCE).await;
}

/// Cancel while a reverse request is pending resolves it as declined and
/// releases its pending entry.
#[tokio::test]
async fn cancel_during_plan_approval() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![Step::PlanApproval(json!({})), Step::Complete]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "plan")).await;
    let request = client.recv().await;
    assert_eq!(request["method"], "exitPlanMode");
    assert_eq!(peer.pending_requests().await, 1);

    let response = client.call("r1", "cancel", json!({ "id": "s1" })).await;
    assert_eq!(response["result"]["cancelled"], true);
    wait_for_status(&orch, "s1", "cancelled").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while peer.pending_requests().await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "abandoned exitPlanMode stayed pending"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!peer.is_closed(), "connection stays usable");
}

// ── Permission mode ─────────────────────────────────────────────────────────

/// `updatePermissionMode` reaches the running query and is stored for the next one.
#[tokio::test]
async fn permission_mode_is_forwarded() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![
            vec![Step::AwaitPermission, Step::Complete],
            vec![Step::Complete],
        ],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "go")).await;
    wait_for_status(&orch, "s1", "running").await;
    client
        .send(json!({
            "method": "updatePermissionMode",
            "params": { "id": "s1", "permissionMode": "acceptEdits" }
        }))
        .await;

    let recorded = claude.wait_recorded(1).await;
    assert_eq!(recorded, vec![Recorded::PermissionMode(Some("acceptEdits".into()))]);
    wait_for_status(&orch, "s1", "done").await;

    client.send(query_frame("s1", "claude", "again")).await;
    wait_for_status(&orch, "s1", "done").await;
    let started = claude.started();
    assert_eq!(started[1].permission_mode.as_deref(), Some("acceptEdits"));
    client.expect_silence(SILENCE).await;
}

// ── Disconnect ──────────────────────────────────────────────────────────────

/// Dropping the client abandons the query and marks the session `error`.
#[tokio::test]
async fn disconnect_abandons_query() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![text("working"), Step::WaitForCancel]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "long task")).await;
    client.recv().await;
    drop(client);

    peer.closed().await;
    wait_for_status(&orch, "s1", "error").await;
    let recorded = claude.wait_recorded(1).await;
    assert_eq!(recorded, vec![Recorded::Cancelled], "the runtime must be told to stop");
}

/// Disconnecting during a reverse request does not hang the query.
#[tokio::test]
async fn disconnect_during_reverse_request() {
    let claude = ScriptedRuntime::new(
        AgentKind::Claude,
        vec![vec![Step::PlanApproval(json!({})), Step::WaitForCancel]],
    );
    let orch = orchestrators(&[Arc::clone(&claude)], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client.send(query_frame("s1", "claude", "plan")).await;
    client.recv().await;
    drop(client);

    let recorded = claude.wait_recorded(2).await;
    assert_eq!(
        recorded,
        vec![Recorded::Plan(PlanDecision::declined()), Recorded::Cancelled]
    );
    wait_for_status(&orch, "s1", "error").await;
}

// ── Request methods ─────────────────────────────────────────────────────────

/// `claudeAuth` answers exactly once with an auth status.
#[tokio::test]
async fn claude_auth_answers_once() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Claude, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    client
        .send(json!({
            "id": "r1",
            "method": "claudeAuth",
            "params": { "id": "s1", "options": { "cwd": "/tmp" } }
        }))
        .await;

    let response = client.recv().await;
    assert_eq!(response["id"], "r1");
    assert!(response["result"]["authenticated"].is_boolean(), "got {response}");
    client.expect_silence(SILENCE).await;
}

/// `workspaceInit` creates an idle session for an existing directory.
#[tokio::test]
async fn workspace_init_creates_session() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Codex, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;
    let dir = tempfile::tempdir().expect("temp dir");

    let response = client
        .call(
            "r1",
            "workspaceInit",
            json!({ "id": "s1", "agentKind": "codex", "options": { "cwd": dir.path() } }),
        )
        .await;

    assert_eq!(response["result"]["id"], "s1");
    assert_eq!(response["result"]["agentKind"], "codex");
    assert_eq!(response["result"]["agentType"], "codex");
    assert_eq!(response["result"]["status"], "idle");

    let missing = client
        .call(
            "r2",
            "workspaceInit",
            json!({ "id": "s2", "options": { "cwd": dir.path().join("absent") } }),
        )
        .await;
    assert_eq!(missing["error"]["code"], INVALID_PARAMS);
    assert!(orch.registry().get("s2").await.is_none());

    let file = dir.path().join("notes.txt");
    std::fs::write(&file, b"not a dir").expect("write file");
    let not_dir = client
        .call("r3", "workspaceInit", json!({ "id": "s3", "options": { "cwd": file } }))
        .await;
    assert_eq!(not_dir["error"]["code"], INVALID_PARAMS);
    assert!(orch.registry().get("s3").await.is_none());
}

/// `contextUsage` reports the stored usage, or `-32001` for unknown sessions.
#[tokio::test]
async fn context_usage_reports_snapshot() {
    let codex = ScriptedRuntime::new(
        AgentKind::Codex,
        vec![vec![
            Step::Message(AgentMessage {
                data: json!({ "type": "turn.completed" }),
                is_final: true,
                thread_id: Some("th-1".into()),
                usage: Some(json!({ "input_tokens": 40 })),
                ..AgentMessage::default()
            }),
            Step::Complete,
        ]],
    );
    let orch = orchestrators(&[codex], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    let unknown = client.call("r0", "contextUsage", json!({ "id": "s1" })).await;
    assert_eq!(unknown["error"]["code"], SESSION_NOT_FOUND);

    client.send(query_frame("s1", "codex", "hi")).await;
    client.recv().await;
    wait_for_status(&orch, "s1", "done").await;

    let response = client.call("r1", "contextUsage", json!({ "id": "s1" })).await;
    assert_eq!(
        response["result"],
        json!({ "id": "s1", "agentSessionId": "th-1", "usage": { "input_tokens": 40 } })
    );
}

/// Bad request params answer `-32602`.
#[tokio::test]
async fn bad_request_params_are_invalid() {
    let orch = orchestrators(&[ScriptedRuntime::new(AgentKind::Claude, vec![])], BusyPolicy::Reject);
    let (mut client, _peer) = connect_sidecar(&orch, None).await;

    let response = client.call("r1", "cancel", json!({ "session": "s1" })).await;

    assert_eq!(response["error"]["code"], INVALID_PARAMS);
}
