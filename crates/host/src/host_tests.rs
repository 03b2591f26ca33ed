// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::time::Duration;

use serde_json::{json, Value};

use crate::control::Hooks;
use crate::test_support::{
    idle_host, ready_host, ready_host_with_hooks, wait_for_frames, PromptBehavior,
    RecordingReporter, RecordingSink, RecordingTelemetry, StubAgent,
};

fn small_opts() -> HostOptions {
    HostOptions {
        message_buffer_size: 100,
        viewer_send_buffer: 16,
        ..HostOptions::default()
    }
}

fn buffer_json(host: &SessionHost) -> Vec<Value> {
    host.buffer
        .lock()
        .snapshot()
        .iter()
        .filter_map(|m| serde_json::from_slice(&m.data).ok())
        .collect()
}

async fn wait_for_status(host: &Arc<SessionHost>, status: HostStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while host.status() != status {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {status:?}, at {:?}",
            host.status()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn prompt_params(text: &str) -> Value {
    json!({ "prompt": [ { "type": "text", "text": text } ] })
}

// ===== Scenario: late-join replay ===========================================

#[tokio::test]
async fn late_joining_viewer_replays_the_buffer_in_order() {
    let host = idle_host(small_opts());
    for i in 0..3 {
        host.broadcast(Bytes::from(format!("{{\"seq\":{i}}}")), false);
    }

    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();

    let frames = wait_for_frames(&log, 6).await;
    assert_eq!(frames.len(), 6);

    assert_eq!(frames[0]["type"], "session_state");
    assert_eq!(frames[0]["status"], "idle");
    assert_eq!(frames[0]["replayCount"], 3);

    for i in 0..3 {
        assert_eq!(frames[1 + i]["seq"], i);
    }

    assert_eq!(frames[4]["type"], "session_replay_complete");
    assert_eq!(frames[5]["type"], "session_state");
    assert_eq!(frames[5]["replayCount"], 0);
    host.stop().await;
}

#[tokio::test]
async fn attach_to_an_empty_host_still_gets_the_state_sandwich() {
    let host = idle_host(small_opts());
    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();

    let frames = wait_for_frames(&log, 3).await;
    assert_eq!(frames[0]["type"], "session_state");
    assert_eq!(frames[0]["replayCount"], 0);
    assert_eq!(frames[1]["type"], "session_replay_complete");
    assert_eq!(frames[2]["type"], "session_state");
    assert_eq!(frames[2]["replayCount"], 0);
    host.stop().await;
}

#[tokio::test]
async fn replay_delivers_more_messages_than_the_viewer_queue_holds() {
    // The per-item blocking replay send must deliver a buffer that dwarfs
    // the viewer queue capacity.
    let mut opts = small_opts();
    opts.viewer_send_buffer = 8;
    let host = idle_host(opts);
    for i in 0..100 {
        host.broadcast(Bytes::from(format!("{{\"seq\":{i}}}")), false);
    }

    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();

    let frames = wait_for_frames(&log, 103).await;
    assert_eq!(frames[0]["replayCount"], 100);
    for i in 0..100 {
        assert_eq!(frames[1 + i]["seq"], i, "replay out of order at {i}");
    }
    assert_eq!(frames[101]["type"], "session_replay_complete");
    assert_eq!(frames[102]["replayCount"], 0);
    host.stop().await;
}

// ===== Scenario: fan-out ====================================================

#[tokio::test]
async fn broadcast_reaches_every_attached_viewer() {
    let host = idle_host(small_opts());

    let (sink1, log1) = RecordingSink::new();
    let (sink2, log2) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink1).await.unwrap();
    host.attach_viewer("v2".to_owned(), sink2).await.unwrap();
    wait_for_frames(&log1, 3).await;
    wait_for_frames(&log2, 3).await;

    host.broadcast(Bytes::from_static(br#"{"test":"broadcast"}"#), false);

    let f1 = wait_for_frames(&log1, 4).await;
    let f2 = wait_for_frames(&log2, 4).await;
    assert_eq!(f1[3]["test"], "broadcast");
    assert_eq!(f2[3]["test"], "broadcast");
    host.stop().await;
}

#[tokio::test]
async fn concurrent_broadcasters_fill_the_buffer_with_increasing_seqs() {
    let mut opts = HostOptions::default();
    opts.message_buffer_size = 1000;
    let host = idle_host(opts);

    let mut tasks = Vec::new();
    for t in 0..10 {
        let host = Arc::clone(&host);
        tasks.push(tokio::spawn(async move {
            for i in 0..200 {
                host.broadcast(Bytes::from(format!("{{\"t\":{t},\"i\":{i}}}")), false);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let buf = host.buffer.lock();
    assert_eq!(buf.len(), 1000);
    assert_eq!(buf.total_appended(), 2000);
    let snap = buf.snapshot();
    for pair in snap.windows(2) {
        assert!(pair[0].seq_num < pair[1].seq_num);
    }
}

// ===== Scenario: synthetic user echo ========================================

#[tokio::test]
async fn prompt_synthesizes_user_chunks_before_the_result() {
    let agent = StubAgent {
        prompt: PromptBehavior::Reply {
            delay: Duration::from_millis(50),
            stop_reason: "end_turn".to_owned(),
            updates: Vec::new(),
        },
        ..StubAgent::default()
    };
    let reporter = Arc::new(RecordingReporter::default());
    let mut hooks = Hooks::default();
    hooks.reporter = Arc::clone(&reporter) as Arc<dyn crate::control::MessageReporter>;
    let host = ready_host_with_hooks(small_opts(), agent, hooks);

    host.handle_prompt(json!(1), prompt_params("hello"), "v1").await;

    let frames = buffer_json(&host);
    let kinds: Vec<String> = frames
        .iter()
        .map(|f| {
            if let Some(t) = f.get("type").and_then(Value::as_str) {
                t.to_owned()
            } else if f.get("method").is_some() {
                f["method"].as_str().unwrap_or_default().to_owned()
            } else {
                "result".to_owned()
            }
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["session/update", "session_prompting", "session_prompt_done", "result"]
    );

    // The synthesized notification carries the user text.
    assert_eq!(
        frames[0]["params"]["update"]["sessionUpdate"], "user_message_chunk",
    );
    assert_eq!(frames[0]["params"]["update"]["content"]["text"], "hello");

    // The final frame is the prompt result for the requesting id.
    assert_eq!(frames[3]["id"], 1);
    assert_eq!(frames[3]["result"]["stopReason"], "end_turn");

    // The user record also reached the reporter.
    let records = reporter.records.lock();
    assert!(records
        .iter()
        .any(|r| r.role == crate::extract::Role::User && r.content == "hello"));

    assert_eq!(host.status(), HostStatus::Ready);
    host.stop().await;
}

#[tokio::test]
async fn agent_updates_during_a_prompt_flow_through_the_buffer() {
    let agent = StubAgent {
        prompt: PromptBehavior::Reply {
            delay: Duration::from_millis(10),
            stop_reason: "end_turn".to_owned(),
            updates: vec![json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "thinking about it" },
            })],
        },
        ..StubAgent::default()
    };
    let reporter = Arc::new(RecordingReporter::default());
    let mut hooks = Hooks::default();
    hooks.reporter = Arc::clone(&reporter) as Arc<dyn crate::control::MessageReporter>;
    let host = ready_host_with_hooks(small_opts(), agent, hooks);

    host.handle_prompt(json!(2), prompt_params("question"), "v1").await;

    let frames = buffer_json(&host);
    assert!(frames.iter().any(|f| {
        f["params"]["update"]["sessionUpdate"] == "agent_message_chunk"
    }));
    let records = reporter.records.lock();
    assert!(records
        .iter()
        .any(|r| r.role == crate::extract::Role::Assistant && r.content == "thinking about it"));
    host.stop().await;
}

// ===== Prompt gate and errors ===============================================

#[tokio::test]
async fn prompt_without_an_agent_session_is_rejected() {
    let host = idle_host(small_opts());
    host.handle_prompt(json!(5), prompt_params("hi"), "v1").await;

    let frames = buffer_json(&host);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["id"], 5);
    assert_eq!(frames[0]["error"]["code"], -32603);
}

#[tokio::test]
async fn empty_prompt_is_rejected_with_invalid_params() {
    let host = ready_host(small_opts(), StubAgent::default());
    host.handle_prompt(json!(6), json!({ "prompt": [] }), "v1").await;

    let frames = buffer_json(&host);
    assert_eq!(frames[0]["error"]["code"], -32602);
    host.stop().await;
}

#[tokio::test]
async fn second_concurrent_prompt_is_rejected() {
    let host = ready_host(
        small_opts(),
        StubAgent { prompt: PromptBehavior::Ignore, ..StubAgent::default() },
    );

    let first = Arc::clone(&host);
    tokio::spawn(async move {
        first.handle_prompt(json!(1), prompt_params("first"), "v1").await;
    });
    wait_for_status(&host, HostStatus::Prompting).await;

    host.handle_prompt(json!(2), prompt_params("second"), "v2").await;

    let frames = buffer_json(&host);
    let rejection = frames
        .iter()
        .find(|f| f["id"] == 2 && f.get("error").is_some())
        .unwrap_or_else(|| panic!("no rejection frame in {frames:?}"));
    assert_eq!(rejection["error"]["code"], -32603);
    host.stop().await;
}

#[tokio::test]
async fn prompt_timeout_force_stops_the_agent() {
    let mut opts = small_opts();
    opts.prompt_timeout = Duration::from_millis(40);
    let host = ready_host(
        opts,
        StubAgent { prompt: PromptBehavior::Ignore, ..StubAgent::default() },
    );

    let prompt = Arc::clone(&host);
    tokio::spawn(async move {
        prompt.handle_prompt(json!(1), prompt_params("slow"), "v1").await;
    });

    wait_for_status(&host, HostStatus::Error).await;
    assert!(!*host.prompt_in_flight.lock());
    assert_eq!(host.prompt_slot.lock().active_id, 0);

    let frames = buffer_json(&host);
    assert!(frames.iter().any(|f| f["type"] == "session_prompt_done"));
    assert!(frames
        .iter()
        .any(|f| f["type"] == "agent_status" && f["status"] == "error"));
    assert!(frames
        .iter()
        .any(|f| f.get("error").is_some() && f["error"]["message"] == "prompt timed out"));
    host.stop().await;
}

// ===== Scenario: cancel + force-stop ========================================

#[tokio::test]
async fn cancel_with_no_prompt_in_flight_is_a_noop() {
    let host = ready_host(small_opts(), StubAgent::default());
    host.cancel_prompt();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.status(), HostStatus::Ready);
    host.stop().await;
}

#[tokio::test]
async fn cancel_force_stops_an_agent_that_ignores_it() {
    let mut opts = small_opts();
    opts.prompt_cancel_grace = Duration::from_millis(10);
    let host = ready_host(
        opts,
        StubAgent { prompt: PromptBehavior::Ignore, ..StubAgent::default() },
    );

    let prompt = Arc::clone(&host);
    tokio::spawn(async move {
        prompt.handle_prompt(json!(1), prompt_params("stuck"), "v1").await;
    });
    wait_for_status(&host, HostStatus::Prompting).await;

    host.cancel_prompt();
    wait_for_status(&host, HostStatus::Error).await;

    // Gate fully released.
    assert!(!*host.prompt_in_flight.lock());
    assert_eq!(host.prompt_slot.lock().active_id, 0);
    assert!(host.prompt_slot.lock().cancel.is_none());

    let frames = buffer_json(&host);
    assert!(frames.iter().any(|f| f["type"] == "session_prompt_done"));
    assert!(frames
        .iter()
        .any(|f| f["type"] == "agent_status" && f["status"] == "error"));
    host.stop().await;
}

#[tokio::test]
async fn cooperative_cancel_finishes_the_turn_normally() {
    let mut opts = small_opts();
    opts.prompt_cancel_grace = Duration::from_millis(50);
    let host = ready_host(
        opts,
        StubAgent { prompt: PromptBehavior::EndOnCancel, ..StubAgent::default() },
    );

    let prompt = Arc::clone(&host);
    tokio::spawn(async move {
        prompt.handle_prompt(json!(1), prompt_params("work"), "v1").await;
    });
    wait_for_status(&host, HostStatus::Prompting).await;

    host.cancel_prompt();
    host.send_cancel_to_agent().await;

    wait_for_status(&host, HostStatus::Ready).await;
    let frames = buffer_json(&host);
    let result = frames.iter().find(|f| f.get("result").is_some()).unwrap();
    assert_eq!(result["result"]["stopReason"], "cancelled");

    // The delayed force-stop must not fire once the prompt has returned.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(host.status(), HostStatus::Ready);
    host.stop().await;
}

// ===== Stop / suspend =======================================================

#[tokio::test]
async fn stop_is_terminal_and_idempotent() {
    let host = idle_host(small_opts());
    let (sink1, log1) = RecordingSink::new();
    let (sink2, log2) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink1).await.unwrap();
    host.attach_viewer("v2".to_owned(), sink2).await.unwrap();
    wait_for_frames(&log1, 3).await;
    wait_for_frames(&log2, 3).await;

    host.stop().await;
    host.stop().await;
    host.stop().await;

    assert_eq!(host.status(), HostStatus::Stopped);
    assert_eq!(host.viewer_count(), 0);

    // Every viewer socket got a GoingAway close frame.
    for log in [&log1, &log2] {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let closed = log
                .lock()
                .iter()
                .any(|e| *e == crate::test_support::SinkEvent::GoingAway);
            if closed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no close frame");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // Attaching to a stopped host fails.
    let (sink3, _log3) = RecordingSink::new();
    assert!(host.attach_viewer("v3".to_owned(), sink3).await.is_none());
}

#[tokio::test]
async fn suspend_returns_the_restore_hint() {
    let host = ready_host(small_opts(), StubAgent::default());
    let hint = host.suspend().await.unwrap();
    assert_eq!(hint.acp_session_id, "sess-stub");
    assert_eq!(hint.agent_type, "stub");
    assert_eq!(host.status(), HostStatus::Stopped);

    // Second suspend: already terminal, no hint.
    assert!(host.suspend().await.is_none());
}

// ===== Idle auto-suspend ====================================================

#[tokio::test]
async fn detach_arms_the_suspend_timer_and_reattach_cancels_it() {
    let mut opts = small_opts();
    opts.idle_suspend_timeout = Duration::from_millis(60);
    let host = idle_host(opts);

    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();
    wait_for_frames(&log, 3).await;
    host.detach_viewer("v1");
    assert!(host.viewers.lock().suspend_timer.is_some());

    // Re-attach within the timeout cancels the pending suspension.
    let (sink2, log2) = RecordingSink::new();
    host.attach_viewer("v2".to_owned(), sink2).await.unwrap();
    wait_for_frames(&log2, 3).await;
    assert!(host.viewers.lock().suspend_timer.is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_ne!(host.status(), HostStatus::Stopped);
    host.stop().await;
}

#[tokio::test]
async fn idle_timeout_suspends_a_viewerless_host() {
    let mut opts = small_opts();
    opts.idle_suspend_timeout = Duration::from_millis(40);
    let host = idle_host(opts);

    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();
    wait_for_frames(&log, 3).await;
    host.detach_viewer("v1");

    wait_for_status(&host, HostStatus::Stopped).await;
}

#[tokio::test]
async fn zero_idle_timeout_never_arms_a_timer() {
    let host = idle_host(small_opts());
    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();
    wait_for_frames(&log, 3).await;
    host.detach_viewer("v1");
    assert!(host.viewers.lock().suspend_timer.is_none());
    host.stop().await;
}

#[tokio::test]
async fn auto_suspend_never_interrupts_a_running_prompt() {
    let mut opts = small_opts();
    opts.idle_suspend_timeout = Duration::from_millis(30);
    let host = ready_host(
        opts,
        StubAgent { prompt: PromptBehavior::Ignore, ..StubAgent::default() },
    );

    let prompt = Arc::clone(&host);
    tokio::spawn(async move {
        prompt.handle_prompt(json!(1), prompt_params("busy"), "v1").await;
    });
    wait_for_status(&host, HostStatus::Prompting).await;

    // Arm the timer by churning a viewer while the prompt runs.
    let (sink, log) = RecordingSink::new();
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();
    wait_for_frames(&log, 3).await;
    host.detach_viewer("v1");
    assert!(host.viewers.lock().suspend_timer.is_some());

    // The tick sees the prompt and re-arms instead of suspending.
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert_eq!(host.status(), HostStatus::Prompting);
    assert!(host.viewers.lock().suspend_timer.is_some());
    host.stop().await;
}

// ===== Crash handling =======================================================

#[tokio::test]
async fn rapid_exit_is_reported_even_when_ownership_was_lost() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let mut hooks = Hooks::default();
    hooks.telemetry = Arc::clone(&telemetry) as Arc<dyn crate::control::Telemetry>;
    let host = SessionHost::new(small_opts(), Arc::new(hooks));

    // A process the host does not own (state.process is None): the
    // ownership check fails, but the crash must be reported first.
    let spec = crate::proc::SpawnSpec {
        container_cmd: "docker".to_owned(),
        container: String::new(),
        user: None,
        workdir: None,
        env: Vec::new(),
        command: vec!["sh".to_owned(), "-c".to_owned(), "echo fatal >&2; exit 1".to_owned()],
        stop_grace: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
    };
    let (process, _stdin, _stdout) = crate::proc::AgentProcess::spawn(&spec).unwrap();
    host.spawn_exit_monitor(process, "stub".to_owned());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while telemetry.errors.lock().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "crash was never reported");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let errors = telemetry.errors.lock();
    assert!(errors[0].contains("fatal"), "stderr tail missing: {}", errors[0]);
    // Ownership was lost, so the host state is untouched.
    assert_eq!(host.status(), HostStatus::Idle);
}

#[tokio::test]
async fn owned_rapid_exit_transitions_to_error() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let mut hooks = Hooks::default();
    hooks.telemetry = Arc::clone(&telemetry) as Arc<dyn crate::control::Telemetry>;
    let host = SessionHost::new(small_opts(), Arc::new(hooks));

    let spec = crate::proc::SpawnSpec {
        container_cmd: "docker".to_owned(),
        container: String::new(),
        user: None,
        workdir: None,
        env: Vec::new(),
        command: vec!["sh".to_owned(), "-c".to_owned(), "exit 7".to_owned()],
        stop_grace: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
    };
    let (process, _stdin, _stdout) = crate::proc::AgentProcess::spawn(&spec).unwrap();
    {
        let mut state = host.state.lock();
        state.process = Some(Arc::clone(&process));
        state.status = HostStatus::Ready;
        state.agent_type = "stub".to_owned();
    }
    host.spawn_exit_monitor(process, "stub".to_owned());

    wait_for_status(&host, HostStatus::Error).await;
    assert!(!telemetry.errors.lock().is_empty());

    let frames = buffer_json(&host);
    assert!(frames
        .iter()
        .any(|f| f["type"] == "agent_status" && f["status"] == "error"));
}

#[tokio::test]
async fn exhausted_restart_budget_lands_in_error() {
    let mut opts = small_opts();
    // Window 0 means no exit counts as rapid; budget 0 means the first
    // crash already exceeds it.
    opts.rapid_exit_window = Duration::ZERO;
    opts.max_restart_attempts = 0;
    let host = idle_host(opts);

    let spec = crate::proc::SpawnSpec {
        container_cmd: "docker".to_owned(),
        container: String::new(),
        user: None,
        workdir: None,
        env: Vec::new(),
        command: vec!["sh".to_owned(), "-c".to_owned(), "exit 1".to_owned()],
        stop_grace: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
    };
    let (process, _stdin, _stdout) = crate::proc::AgentProcess::spawn(&spec).unwrap();
    {
        let mut state = host.state.lock();
        state.process = Some(Arc::clone(&process));
        state.status = HostStatus::Ready;
        state.agent_type = "stub".to_owned();
    }
    host.spawn_exit_monitor(process, "stub".to_owned());

    wait_for_status(&host, HostStatus::Error).await;
    assert_eq!(host.restart_count(), 1);
}

// ===== Client-callable methods ==============================================

#[tokio::test]
async fn agent_file_methods_respect_the_size_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = small_opts();
    opts.file_max_size = 16;
    opts.spawn.workdir = Some(dir.path().to_string_lossy().into_owned());
    let host = idle_host(opts);

    host.on_agent_request(
        "fs/write_text_file",
        json!({ "path": "note.txt", "content": "hello" }),
    )
    .await
    .unwrap();
    let read = host
        .on_agent_request("fs/read_text_file", json!({ "path": "note.txt" }))
        .await
        .unwrap();
    assert_eq!(read["content"], "hello");

    let over_cap = host
        .on_agent_request(
            "fs/write_text_file",
            json!({ "path": "big.txt", "content": "x".repeat(32) }),
        )
        .await;
    assert!(matches!(over_cap, Err(AcpError::Rpc { code: -32602, .. })));

    let unsupported = host.on_agent_request("terminal/create", json!({})).await;
    assert!(matches!(unsupported, Err(AcpError::Rpc { code: -32601, .. })));
}

#[tokio::test]
async fn read_text_file_selects_lines() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = small_opts();
    opts.spawn.workdir = Some(dir.path().to_string_lossy().into_owned());
    let host = idle_host(opts);

    host.on_agent_request(
        "fs/write_text_file",
        json!({ "path": "lines.txt", "content": "one\ntwo\nthree\nfour" }),
    )
    .await
    .unwrap();

    let read = host
        .on_agent_request(
            "fs/read_text_file",
            json!({ "path": "lines.txt", "line": 2, "limit": 2 }),
        )
        .await
        .unwrap();
    assert_eq!(read["content"], "two\nthree");
}

#[tokio::test]
async fn permission_requests_follow_the_mode() {
    let host = idle_host(small_opts());
    let params = json!({
        "sessionId": "s",
        "options": [
            { "optionId": "allow-once", "kind": "allow_once" },
            { "optionId": "reject", "kind": "reject_once" },
        ],
    });

    // Default mode answers cancelled.
    let res = host
        .on_agent_request("session/request_permission", params.clone())
        .await
        .unwrap();
    assert_eq!(res["outcome"]["outcome"], "cancelled");

    // Bypass mode selects the first allow-kind option.
    host.state.lock().permission_mode = PermissionMode::BypassPermissions;
    let res = host.on_agent_request("session/request_permission", params).await.unwrap();
    assert_eq!(res["outcome"]["outcome"], "selected");
    assert_eq!(res["outcome"]["optionId"], "allow-once");

    // Every request was surfaced to viewers through the buffer.
    let frames = buffer_json(&host);
    let surfaced =
        frames.iter().filter(|f| f["method"] == "session/request_permission").count();
    assert_eq!(surfaced, 2);
}

// ===== Priority sends =======================================================

#[tokio::test]
async fn priority_broadcast_survives_a_saturated_viewer_queue() {
    let mut opts = small_opts();
    opts.viewer_send_buffer = 2;
    let host = idle_host(opts);

    // A viewer whose sink wedges after the attach frames stops draining.
    let (sink, log) = RecordingSink::stalling_after(3);
    host.attach_viewer("v1".to_owned(), sink).await.unwrap();
    wait_for_frames(&log, 3).await;

    // One frame gets stuck in the sink; two more saturate the queue.
    host.broadcast(Bytes::from_static(b"{\"n\":1}"), false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    host.broadcast(Bytes::from_static(b"{\"n\":2}"), false);
    host.broadcast(Bytes::from_static(b"{\"n\":3}"), false);
    let viewer = host.viewers.lock().viewers.get("v1").cloned().unwrap();
    assert_eq!(viewer.queue.len(), 2);

    // A further normal frame is dropped outright...
    host.broadcast(Bytes::from_static(b"{\"n\":4}"), false);
    assert_eq!(viewer.queue.len(), 2);

    // ...but a control frame evicts the queued head and gets in.
    host.broadcast_control(&crate::frames::ControlFrame::SessionPrompting {});
    assert_eq!(viewer.queue.len(), 2);
    host.stop().await;
}
