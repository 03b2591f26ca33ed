// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process fixtures for exercising the session host without a real agent
//! or browser: a scripted ACP agent speaking over duplex pipes, a recording
//! viewer sink, and recording collaborator hooks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::control::{Hooks, MessageReporter, Telemetry};
use crate::extract::MessageRecord;
use crate::host::{HostOptions, SessionHost};
use crate::viewer::ViewerSink;

// ── Recording viewer sink ────────────────────────────────────────────────────

/// What a viewer's write loop pushed into its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Text(String),
    Ping,
    GoingAway,
}

pub type SinkLog = Arc<Mutex<Vec<SinkEvent>>>;

/// A `ViewerSink` that records frames instead of writing to a socket.
/// `fail_after` makes the nth text send (0-based) and all later sends fail,
/// exercising the write-failure path; `stall_after` makes later sends hang
/// forever, simulating a wedged socket.
pub struct RecordingSink {
    log: SinkLog,
    sent: usize,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> (Box<dyn ViewerSink>, SinkLog) {
        Self::build(None, None)
    }

    pub fn failing_after(n: usize) -> (Box<dyn ViewerSink>, SinkLog) {
        Self::build(Some(n), None)
    }

    pub fn stalling_after(n: usize) -> (Box<dyn ViewerSink>, SinkLog) {
        Self::build(None, Some(n))
    }

    fn build(
        fail_after: Option<usize>,
        stall_after: Option<usize>,
    ) -> (Box<dyn ViewerSink>, SinkLog) {
        let log: SinkLog = Arc::new(Mutex::new(Vec::new()));
        (Box::new(Self { log: Arc::clone(&log), sent: 0, fail_after, stall_after }), log)
    }
}

impl ViewerSink for RecordingSink {
    fn send_text(&mut self, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            if self.stall_after.is_some_and(|n| self.sent >= n) {
                std::future::pending::<()>().await;
            }
            if self.fail_after.is_some_and(|n| self.sent >= n) {
                anyhow::bail!("sink write failure injected");
            }
            self.sent += 1;
            self.log.lock().push(SinkEvent::Text(String::from_utf8_lossy(&data).into_owned()));
            Ok(())
        })
    }

    fn send_ping(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.log.lock().push(SinkEvent::Ping);
            Ok(())
        })
    }

    fn send_going_away(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.log.lock().push(SinkEvent::GoingAway);
            Ok(())
        })
    }
}

/// Text frames recorded so far, parsed as JSON.
pub fn sink_json(log: &SinkLog) -> Vec<Value> {
    log.lock()
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Text(t) => serde_json::from_str(t).ok(),
            _ => None,
        })
        .collect()
}

/// Poll until the sink holds at least `n` text frames (or panic after 2 s).
pub async fn wait_for_frames(log: &SinkLog, n: usize) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let frames = sink_json(log);
        if frames.len() >= n {
            return frames;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} frames, have {}",
            frames.len()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Scripted agent ───────────────────────────────────────────────────────────

/// How the stub agent answers `session/prompt`.
#[derive(Debug, Clone)]
pub enum PromptBehavior {
    /// Emit the given `session/update` notifications, then return the stop
    /// reason after `delay`.
    Reply { delay: Duration, stop_reason: String, updates: Vec<Value> },
    /// Never answer, and ignore `session/cancel`.
    Ignore,
    /// Never answer until `session/cancel` arrives, then finish the turn
    /// with `stopReason: "cancelled"`.
    EndOnCancel,
}

#[derive(Debug, Clone)]
pub struct StubAgent {
    pub session_id: String,
    pub load_session: bool,
    pub load_fails: bool,
    pub prompt: PromptBehavior,
}

impl Default for StubAgent {
    fn default() -> Self {
        Self {
            session_id: "sess-stub".to_owned(),
            load_session: false,
            load_fails: false,
            prompt: PromptBehavior::Reply {
                delay: Duration::from_millis(0),
                stop_reason: "end_turn".to_owned(),
                updates: Vec::new(),
            },
        }
    }
}

impl StubAgent {
    /// Spawn the scripted agent; returns the host side of the stdio pipes.
    pub fn spawn(self) -> DuplexStream {
        let (host_io, agent_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(run_stub_agent(agent_io, self));
        host_io
    }
}

async fn run_stub_agent(io: DuplexStream, cfg: StubAgent) {
    let (read_half, write_half) = tokio::io::split(io);
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();
    let mut pending_prompt: Option<Value> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else { continue };
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default().to_owned();
        let id = msg.get("id").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" => {
                write_reply(
                    &writer,
                    &id,
                    serde_json::json!({
                        "agentCapabilities": { "loadSession": cfg.load_session },
                    }),
                )
                .await;
            }
            "session/new" => {
                write_reply(&writer, &id, serde_json::json!({ "sessionId": cfg.session_id }))
                    .await;
            }
            "session/load" => {
                if cfg.load_fails {
                    write_error(&writer, &id, -32603, "no such session").await;
                } else {
                    write_reply(&writer, &id, serde_json::json!({})).await;
                }
            }
            "session/set_mode" | "session/set_model" => {
                write_reply(&writer, &id, serde_json::json!({})).await;
            }
            "session/prompt" => match cfg.prompt.clone() {
                PromptBehavior::Reply { delay, stop_reason, updates } => {
                    let writer = Arc::clone(&writer);
                    let session_id = cfg.session_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        for update in updates {
                            let note = serde_json::json!({
                                "jsonrpc": "2.0",
                                "method": "session/update",
                                "params": { "sessionId": session_id, "update": update },
                            });
                            write_raw(&writer, &note).await;
                        }
                        write_reply(&writer, &id, serde_json::json!({ "stopReason": stop_reason }))
                            .await;
                    });
                }
                PromptBehavior::Ignore => {}
                PromptBehavior::EndOnCancel => {
                    pending_prompt = Some(id);
                }
            },
            "session/cancel" => {
                if let Some(id) = pending_prompt.take() {
                    write_reply(&writer, &id, serde_json::json!({ "stopReason": "cancelled" }))
                        .await;
                }
            }
            _ if !id.is_null() => {
                write_error(&writer, &id, -32601, "method not found").await;
            }
            _ => {}
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<tokio::io::WriteHalf<DuplexStream>>>;

async fn write_raw(writer: &SharedWriter, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    let _ = writer.lock().await.write_all(line.as_bytes()).await;
}

async fn write_reply(writer: &SharedWriter, id: &Value, result: Value) {
    write_raw(writer, &serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })).await;
}

async fn write_error(writer: &SharedWriter, id: &Value, code: i64, message: &str) {
    write_raw(
        writer,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }),
    )
    .await;
}

// ── Host builders ────────────────────────────────────────────────────────────

/// A host with no agent bound, using no-op hooks.
pub fn idle_host(opts: HostOptions) -> Arc<SessionHost> {
    SessionHost::new(opts, Arc::new(Hooks::default()))
}

/// A host in the ready state wired to a scripted agent over duplex pipes.
pub fn ready_host(opts: HostOptions, agent: StubAgent) -> Arc<SessionHost> {
    ready_host_with_hooks(opts, agent, Hooks::default())
}

pub fn ready_host_with_hooks(opts: HostOptions, agent: StubAgent, hooks: Hooks) -> Arc<SessionHost> {
    let session_id = agent.session_id.clone();
    let host = SessionHost::new(opts, Arc::new(hooks));
    let io = agent.spawn();
    let (read_half, write_half) = tokio::io::split(io);
    let transport = host.attach_transport(read_half, write_half);
    host.bind_agent_for_tests(transport, &session_id, "stub");
    host
}

// ── Recording hooks ──────────────────────────────────────────────────────────

/// Message reporter that collects records in memory.
#[derive(Default)]
pub struct RecordingReporter {
    pub records: Mutex<Vec<MessageRecord>>,
}

impl MessageReporter for RecordingReporter {
    fn enqueue(&self, record: MessageRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Telemetry sink that collects reported errors in memory.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub errors: Mutex<Vec<String>>,
}

impl Telemetry for RecordingTelemetry {
    fn boot_log(&self, _step: &str, _status: &str, _msg: &str, _detail: Option<&str>) {}

    fn report_error(&self, msg: &str, detail: &str) {
        self.errors.lock().push(format!("{msg}: {detail}"));
    }

    fn report_warn(&self, _msg: &str, _detail: &str) {}
    fn report_info(&self, _msg: &str, _detail: &str) {}
}
