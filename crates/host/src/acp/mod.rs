// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent Client Protocol: line-delimited JSON-RPC 2.0 over an agent
//! subprocess's stdio.

mod client;
mod transport;
pub mod types;

pub use client::{
    initialize, load_session, new_session, prompt, send_cancel, set_session_mode,
    set_session_model, AgentCapabilities, PROTOCOL_VERSION,
};
pub use transport::{AcpNotification, AcpTransport, NotificationHandler, RequestHandler};

use std::fmt;

/// Transport-level and peer-reported errors for ACP calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcpError {
    /// The transport shut down (process exited, pipes closed, or the host
    /// closed it) while the call was outstanding.
    Closed,
    /// The call's deadline elapsed before a response arrived.
    Timeout,
    /// The peer answered with a JSON-RPC error object.
    Rpc { code: i64, message: String },
}

impl AcpError {
    pub fn method_not_supported(method: &str) -> Self {
        Self::Rpc { code: -32601, message: format!("method not supported: {method}") }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::Rpc { code: -32602, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Rpc { code: -32603, message: message.into() }
    }
}

impl fmt::Display for AcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("agent transport closed"),
            Self::Timeout => f.write_str("agent call timed out"),
            Self::Rpc { code, message } => write!(f, "agent error [{code}]: {message}"),
        }
    }
}

impl std::error::Error for AcpError {}
