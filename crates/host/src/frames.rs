// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser-facing frame types for the perch real-time protocol.
//!
//! Control frames use internally-tagged JSON enums (`{"type": "ping", ...}`)
//! in both directions; everything else on the wire is JSON-RPC 2.0 relayed
//! between the browser and the agent.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Session host status as seen by viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Idle,
    Starting,
    Ready,
    Prompting,
    Error,
    Stopped,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Prompting => "prompting",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Agent lifecycle phase broadcast while SelectAgent / restart flows run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Starting,
    Installing,
    Ready,
    Error,
    Restarting,
}

/// Control frames sent host → browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlFrame {
    AgentStatus {
        status: AgentPhase,
        agent_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SessionState {
        status: HostStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        replay_count: usize,
    },
    SessionReplayComplete {},
    SessionPrompting {},
    SessionPromptDone {},
    Pong {},
}

impl ControlFrame {
    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        serde_json::to_vec(self).map(Bytes::from).unwrap_or_default()
    }
}

/// Control frames sent browser → host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlRequest {
    SelectAgent { agent_type: String },
    Ping {},
}

/// A JSON-RPC frame received from a viewer, kept alongside its raw bytes so
/// unknown methods can be forwarded to the agent verbatim.
#[derive(Debug, Clone)]
pub struct RpcFrame {
    pub id: Value,
    pub method: Option<String>,
    pub params: Value,
    pub raw: Bytes,
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Control(ControlRequest),
    Rpc(RpcFrame),
}

/// Classify an inbound text frame: control (has `type`), JSON-RPC (has
/// `jsonrpc`), or unparseable.
pub fn classify(text: &str) -> anyhow::Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;

    if value.get("type").is_some() {
        let control: ControlRequest = serde_json::from_value(value)?;
        return Ok(InboundFrame::Control(control));
    }

    if value.get("jsonrpc").is_some() {
        let method = value.get("method").and_then(Value::as_str).map(str::to_owned);
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        return Ok(InboundFrame::Rpc(RpcFrame {
            id,
            method,
            params,
            raw: Bytes::copy_from_slice(text.as_bytes()),
        }));
    }

    anyhow::bail!("frame is neither control nor json-rpc")
}

/// Build a JSON-RPC error envelope (`{jsonrpc, id, error:{code, message}}`).
pub fn rpc_error(id: &Value, code: ErrorCode, message: &str) -> Bytes {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code.jsonrpc_code(), "message": message },
    });
    serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default()
}

/// Build a JSON-RPC result envelope (`{jsonrpc, id, result}`).
pub fn rpc_result(id: &Value, result: &Value) -> Bytes {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    });
    serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default()
}

#[cfg(test)]
#[path = "frames_tests.rs"]
mod tests;
