// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the subset of ACP payloads the host inspects. Everything
//! else passes through as raw JSON.

use serde::{Deserialize, Serialize};

/// Params of a `session/update` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    #[serde(default)]
    pub session_id: String,
    pub update: SessionUpdate,
}

/// The update payload, tagged by `sessionUpdate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    UserMessageChunk { content: ContentChunk },
    AgentMessageChunk { content: ContentChunk },
    ToolCall(ToolCallFields),
    ToolCallUpdate(ToolCallFields),
    /// Thought chunks, plan updates, mode changes: relayed but not
    /// extracted.
    #[serde(other)]
    Other,
}

/// A content block inside message chunks and tool content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentChunk {
    Text { text: String },
    #[serde(other)]
    Other,
}

impl ContentChunk {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Other => None,
        }
    }
}

/// Shared fields of `tool_call` and `tool_call_update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCallFields {
    pub tool_call_id: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub content: Vec<ToolContent>,
    pub locations: Vec<ToolLocation>,
}

/// Content entries attached to a tool call.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Content { content: ContentChunk },
    Diff { path: String },
    #[serde(other)]
    Other,
}

/// A file location referenced by a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLocation {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// Params of a `session/request_permission` request (agent → client).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub kind: String,
}

/// Params of `fs/read_text_file` (agent → client).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    pub path: String,
    pub line: Option<usize>,
    pub limit: Option<usize>,
}

/// Params of `fs/write_text_file` (agent → client).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    pub path: String,
    pub content: String,
}
