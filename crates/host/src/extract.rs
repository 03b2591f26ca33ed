// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conversion of `session/update` notifications into persistable
//! chat-message records for the external message reporter.
//!
//! Pure function of its input: chunk records carry an empty `message_id`
//! (the reporter's store assigns one), tool records reuse the tool call id.

use serde::Serialize;

use crate::acp::types::{
    ContentChunk, SessionUpdate, SessionUpdateParams, ToolCallFields, ToolContent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_metadata: Option<ToolMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolMetadata {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub locations: Vec<RecordLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordLocation {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// Extract zero or more message records from one session update.
pub fn extract(params: &SessionUpdateParams) -> Vec<MessageRecord> {
    match &params.update {
        SessionUpdate::UserMessageChunk { content } => chunk_record(Role::User, content),
        SessionUpdate::AgentMessageChunk { content } => chunk_record(Role::Assistant, content),
        SessionUpdate::ToolCall(fields) => vec![tool_record(fields, true)],
        SessionUpdate::ToolCallUpdate(fields) => {
            // Updates are persisted only when they carry content or a status
            // change; bare progress ticks are noise.
            let content = tool_content(fields);
            if content.is_empty() && fields.status.is_none() {
                return Vec::new();
            }
            vec![tool_record(fields, false)]
        }
        SessionUpdate::Other => Vec::new(),
    }
}

fn chunk_record(role: Role, content: &ContentChunk) -> Vec<MessageRecord> {
    match content.text() {
        Some(text) if !text.is_empty() => vec![MessageRecord {
            message_id: String::new(),
            role,
            content: text.to_owned(),
            tool_metadata: None,
        }],
        _ => Vec::new(),
    }
}

fn tool_record(fields: &ToolCallFields, synthesize_empty: bool) -> MessageRecord {
    let mut content = tool_content(fields);
    if content.is_empty() && synthesize_empty {
        content = "(tool call)".to_owned();
    }
    MessageRecord {
        message_id: fields.tool_call_id.clone(),
        role: Role::Tool,
        content,
        tool_metadata: Some(ToolMetadata {
            kind: fields.kind.clone(),
            status: fields.status.clone(),
            locations: fields
                .locations
                .iter()
                .map(|l| RecordLocation { path: l.path.clone(), line: l.line })
                .collect(),
        }),
    }
}

/// Concatenated text parts (blank lines between), plus a `diff: <path>` line
/// per diff entry.
fn tool_content(fields: &ToolCallFields) -> String {
    let mut parts: Vec<String> = Vec::new();
    for entry in &fields.content {
        match entry {
            ToolContent::Content { content } => {
                if let Some(text) = content.text() {
                    if !text.is_empty() {
                        parts.push(text.to_owned());
                    }
                }
            }
            ToolContent::Diff { path } => parts.push(format!("diff: {path}")),
            ToolContent::Other => {}
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
#[path = "extract_tests.rs"]
mod tests;
