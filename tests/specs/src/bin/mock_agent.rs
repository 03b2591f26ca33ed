// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal ACP agent used by the smoke tests: line-delimited JSON-RPC over
//! stdio. Answers initialize / session/new / session/prompt, streams one
//! assistant chunk per prompt, and honors session/cancel.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let stdin = std::io::stdin();
    let mut pending_prompt: Option<Value> = None;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(&line) else { continue };
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
        let id = msg.get("id").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                reply(
                    &id,
                    json!({
                        "protocolVersion": 1,
                        "agentCapabilities": { "loadSession": false },
                    }),
                );
            }
            "session/new" => {
                reply(&id, json!({ "sessionId": format!("mock-{}", std::process::id()) }));
            }
            "session/set_mode" | "session/set_model" => {
                reply(&id, json!({}));
            }
            "session/prompt" => {
                let session_id = msg
                    .pointer("/params/sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                emit(&json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {
                        "sessionId": session_id,
                        "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": { "type": "text", "text": "mock reply" },
                        },
                    },
                }));
                if std::env::var("MOCK_AGENT_HANG").is_ok() {
                    pending_prompt = Some(id);
                } else {
                    reply(&id, json!({ "stopReason": "end_turn" }));
                }
            }
            "session/cancel" => {
                if let Some(id) = pending_prompt.take() {
                    reply(&id, json!({ "stopReason": "cancelled" }));
                }
            }
            _ if !id.is_null() => {
                emit(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": "method not found" },
                }));
            }
            _ => {}
        }
    }
}

fn reply(id: &Value, result: Value) {
    emit(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
}

fn emit(value: &Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}
