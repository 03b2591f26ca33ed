// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed wrappers for the ACP methods the host drives.

use std::time::Duration;

use serde_json::Value;

use super::{AcpError, AcpTransport};

pub const PROTOCOL_VERSION: u64 = 1;

/// Capabilities advertised by the agent in its `initialize` result.
#[derive(Debug, Clone, Default)]
pub struct AgentCapabilities {
    pub load_session: bool,
}

/// Run the `initialize` handshake.
pub async fn initialize(
    transport: &AcpTransport,
    timeout: Duration,
) -> Result<AgentCapabilities, AcpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": false,
        },
    });
    let result = transport.request_timeout("initialize", params, timeout).await?;
    let load_session = result
        .pointer("/agentCapabilities/loadSession")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(AgentCapabilities { load_session })
}

/// Create a fresh agent session; returns the agent-assigned session id.
pub async fn new_session(transport: &AcpTransport, cwd: &str) -> Result<String, AcpError> {
    let params = serde_json::json!({ "cwd": cwd, "mcpServers": [] });
    let result = transport.request("session/new", params).await?;
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| AcpError::internal("session/new response missing sessionId"))
}

/// Resume a previous session. The agent replays its history as
/// `session/update` notifications while this call is outstanding.
pub async fn load_session(
    transport: &AcpTransport,
    session_id: &str,
    cwd: &str,
) -> Result<(), AcpError> {
    let params = serde_json::json!({
        "sessionId": session_id,
        "cwd": cwd,
        "mcpServers": [],
    });
    transport.request("session/load", params).await.map(|_| ())
}

/// Select the agent-side permission mode. Non-fatal for callers.
pub async fn set_session_mode(
    transport: &AcpTransport,
    session_id: &str,
    mode_id: &str,
) -> Result<(), AcpError> {
    let params = serde_json::json!({ "sessionId": session_id, "modeId": mode_id });
    transport.request("session/set_mode", params).await.map(|_| ())
}

/// Select the agent-side model. Non-fatal for callers.
pub async fn set_session_model(
    transport: &AcpTransport,
    session_id: &str,
    model_id: &str,
) -> Result<(), AcpError> {
    let params = serde_json::json!({ "sessionId": session_id, "modelId": model_id });
    transport.request("session/set_model", params).await.map(|_| ())
}

/// Run one prompt turn. Blocks until the agent completes the turn; session
/// notifications flow independently through the notification path meanwhile.
/// Returns the raw result object (carries `stopReason`).
pub async fn prompt(
    transport: &AcpTransport,
    session_id: &str,
    blocks: &[Value],
) -> Result<Value, AcpError> {
    let params = serde_json::json!({ "sessionId": session_id, "prompt": blocks });
    transport.request("session/prompt", params).await
}

/// Ask the agent to abort the current turn (notification, no reply).
pub async fn send_cancel(transport: &AcpTransport, session_id: &str) -> Result<(), AcpError> {
    transport
        .notify("session/cancel", serde_json::json!({ "sessionId": session_id }))
        .await
}
