// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the HTTP surface and the JSON-RPC
/// frames relayed to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    InvalidParams,
    NoSession,
    PromptBusy,
    PromptTimeout,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::InvalidParams => 400,
            Self::NoSession | Self::PromptBusy => 409,
            Self::PromptTimeout => 504,
            Self::Internal => 500,
        }
    }

    /// JSON-RPC 2.0 error code surfaced to the browser.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::InvalidParams => -32602,
            Self::Unauthorized
            | Self::NoSession
            | Self::PromptBusy
            | Self::PromptTimeout
            | Self::Internal => -32603,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::NoSession => "NO_SESSION",
            Self::PromptBusy => "PROMPT_BUSY",
            Self::PromptTimeout => "PROMPT_TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
