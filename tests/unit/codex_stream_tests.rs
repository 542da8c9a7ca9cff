//! Unit tests for Codex JSON event translation and command construction.

use std::time::Duration;

use serde_json::json;

use agent_sidecar::config::RuntimeConfig;
use agent_sidecar::models::inbound::QueryOptions;
use agent_sidecar::runtime::codex::{CodexOutcome, CodexRuntime, CodexStream};

/// `thread.started` records the thread id.
#[test]
fn thread_started_records_thread_id() {
    let mut stream = CodexStream::default();

    let (msg, outcome) = stream.on_event(json!({ "type": "thread.started", "thread_id": "th-1" }));

    let msg = msg.expect("forwarded");
    assert_eq!(msg.thread_id.as_deref(), Some("th-1"));
    assert_eq!(stream.thread_id(), Some("th-1"));
    assert_eq!(outcome, None);
}

/// Completed agent messages accumulate text; tool items get a summary.
#[test]
fn items_are_translated() {
    let mut stream = CodexStream::default();

    let (first, _) = stream.on_event(json!({
        "type": "item.completed", "item": { "id": "i0", "type": "agent_message", "text": "Checking." }
    }));
    let (tool, _) = stream.on_event(json!({
        "type": "item.started", "item": { "id": "i1", "type": "command_execution", "command": "ls" }
    }));
    let (second, _) = stream.on_event(json!({
        "type": "item.completed", "item": { "id": "i2", "type": "agent_message", "text": "Done." }
    }));

    assert_eq!(first.expect("forwarded").text.as_deref(), Some("Checking."));

    let tool = tool.expect("forwarded");
    assert_eq!(tool.text, None);
    let summary = tool.tool_summary.expect("tool summary");
    assert_eq!(summary[0]["id"], "i1");
    assert_eq!(summary[0]["name"], "command_execution");
    assert_eq!(summary[0]["input"]["command"], "ls");

    let second = second.expect("forwarded");
    assert_eq!(second.text_delta.as_deref(), Some("Done."));
    assert_eq!(second.text.as_deref(), Some("Checking.\n\nDone."));
}

/// `turn.completed` is final and carries usage and the thread id.
#[test]
fn turn_completed_is_final() {
    let mut stream = CodexStream::default();
    stream.on_event(json!({ "type": "thread.started", "thread_id": "th-1" }));

    let (msg, outcome) = stream.on_event(json!({
        "type": "turn.completed", "usage": { "input_tokens": 5, "output_tokens": 2 }
    }));

    let msg = msg.expect("forwarded");
    assert!(msg.is_final);
    assert_eq!(msg.usage, Some(json!({ "input_tokens": 5, "output_tokens": 2 })));
    assert_eq!(msg.thread_id.as_deref(), Some("th-1"));
    assert_eq!(outcome, Some(CodexOutcome::Completed));
}

/// `turn.failed` and `error` report the message; `error` is not forwarded.
#[test]
fn failures_are_reported() {
    let mut stream = CodexStream::default();

    let (msg, outcome) = stream.on_event(json!({
        "type": "turn.failed", "error": { "message": "rate limited" }
    }));
    assert!(msg.is_some());
    assert_eq!(outcome, Some(CodexOutcome::Failed("rate limited".into())));

    let (msg, outcome) = stream.on_event(json!({ "type": "error", "message": "stream closed" }));
    assert!(msg.is_none());
    assert_eq!(outcome, Some(CodexOutcome::Failed("stream closed".into())));
}

/// The first failure sticks unless the turn later completes.
#[test]
fn later_completion_overrides_transient_error() {
    let transient = Some(CodexOutcome::Failed("reconnecting".into()));

    assert_eq!(
        CodexOutcome::settle(transient.clone(), Some(CodexOutcome::Completed)),
        Some(CodexOutcome::Completed)
    );
    assert_eq!(
        CodexOutcome::settle(transient.clone(), Some(CodexOutcome::Failed("turn failed".into()))),
        transient
    );
    assert_eq!(CodexOutcome::settle(transient.clone(), None), transient);
    assert_eq!(CodexOutcome::settle(None, None), None);
}

/// `exec --json` first, config args before the resume subcommand, prompt last
/// behind `--`.
#[test]
fn command_args_order() {
    let runtime = CodexRuntime::new(
        RuntimeConfig {
            cli: "codex".into(),
            args: vec!["--skip-git-repo-check".into()],
            inherit_env: Vec::new(),
        },
        Duration::from_secs(1),
        1024,
    );
    let mut options = QueryOptions::with_cwd("/tmp");
    options.model = Some("o3".into());

    let args = runtime.command_args(&options, Some("th-1"), "fix the bug");

    assert_eq!(
        args,
        vec![
            "exec",
            "--json",
            "--model",
            "o3",
            "--skip-git-repo-check",
            "resume",
            "th-1",
            "--",
            "fix the bug"
        ]
    );

    let fresh = runtime.command_args(&QueryOptions::with_cwd("/tmp"), None, "hi");
    assert_eq!(fresh, vec!["exec", "--json", "--skip-git-repo-check", "--", "hi"]);
}

/// A prompt that looks like a flag stays a positional argument.
#[test]
fn dash_prefixed_prompt_is_positional() {
    let runtime = CodexRuntime::new(
        RuntimeConfig {
            cli: "codex".into(),
            args: Vec::new(),
            inherit_env: Vec::new(),
        },
        Duration::from_secs(1),
        1024,
    );

    let args = runtime.command_args(&QueryOptions::with_cwd("/tmp"), None, "--help me");

    assert_eq!(args, vec!["exec", "--json", "--", "--help me"]);
}
