// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bidirectional line-delimited JSON-RPC peer bound to one agent's stdio.
//!
//! Outbound requests get monotonically increasing integer ids and park a
//! oneshot sender in the pending-call table; the reader task resolves them
//! when the matching response line arrives. Inbound requests (agent → client
//! methods such as `fs/read_text_file`) are answered through the registered
//! request handler; notifications go to the notification handler together
//! with their raw line so they can be relayed verbatim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AcpError;

/// A notification received from the agent.
#[derive(Debug, Clone)]
pub struct AcpNotification {
    pub method: String,
    pub params: Value,
    /// The raw line as received, without the trailing newline.
    pub raw: Bytes,
}

/// Callback for agent notifications (e.g. `session/update`).
pub type NotificationHandler = Arc<dyn Fn(AcpNotification) + Send + Sync>;

/// Handler for agent → client requests; the returned value (or error) is
/// written back with the request's id.
pub type RequestHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, AcpError>> + Send + Sync>;

type Pending = oneshot::Sender<Result<Value, AcpError>>;

pub struct AcpTransport {
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl AcpTransport {
    /// Bind a transport to the given stdio pipes and start its reader task.
    pub fn spawn<R, W>(
        stdout: R,
        stdin: W,
        on_notification: NotificationHandler,
        on_request: RequestHandler,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Arc::new(Self {
            writer: tokio::sync::Mutex::new(Some(Box::new(stdin) as Box<dyn AsyncWrite + Send + Unpin>)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });

        let reader = Arc::clone(&transport);
        tokio::spawn(async move {
            reader.read_loop(stdout, on_notification, on_request).await;
            reader.close();
        });

        transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the transport: drop the writer (closing the agent's stdin),
    /// stop the reader, and fail every pending call with [`AcpError::Closed`].
    pub fn close(self: &Arc<Self>) {
        self.closed.cancel();
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(AcpError::Closed));
        }
        // The writer lock may be held by an in-flight write; take it out of
        // band so stdin still gets closed once that write unblocks.
        match self.writer.try_lock() {
            Ok(mut writer) => {
                writer.take();
            }
            Err(_) => {
                let transport = Arc::clone(self);
                tokio::spawn(async move {
                    transport.writer.lock().await.take();
                });
            }
        }
    }

    /// Send a request and wait for its response. Unbounded; callers that need
    /// a deadline use [`request_timeout`](Self::request_timeout) or rely on
    /// [`close`](Self::close) failing the call.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, AcpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();

        {
            if self.is_closed() {
                return Err(AcpError::Closed);
            }
            self.pending.lock().insert(id, tx);
        }

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_value(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => reply.unwrap_or(Err(AcpError::Closed)),
            _ = self.closed.cancelled() => {
                self.pending.lock().remove(&id);
                Err(AcpError::Closed)
            }
        }
    }

    /// [`request`](Self::request) bounded by `timeout`.
    pub async fn request_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AcpError> {
        match tokio::time::timeout(timeout, self.request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(AcpError::Timeout),
        }
    }

    /// Send a notification (no id, no reply).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), AcpError> {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_value(&frame).await.map(|_| ())
    }

    /// Write a raw JSON line to the agent's stdin (viewer pass-through).
    pub async fn write_raw(&self, raw: &[u8]) -> Result<(), AcpError> {
        let mut line = Vec::with_capacity(raw.len() + 1);
        line.extend_from_slice(raw);
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        self.write_line(&line).await
    }

    async fn write_value(&self, value: &Value) -> Result<(), AcpError> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| AcpError::internal(format!("encode frame: {e}")))?;
        line.push(b'\n');
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &[u8]) -> Result<(), AcpError> {
        if self.is_closed() {
            return Err(AcpError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(AcpError::Closed);
        };
        if w.write_all(line).await.is_err() || w.flush().await.is_err() {
            return Err(AcpError::Closed);
        }
        Ok(())
    }

    async fn read_loop<R>(
        self: &Arc<Self>,
        stdout: R,
        on_notification: NotificationHandler,
        on_request: RequestHandler,
    ) where
        R: AsyncRead + Send + Unpin,
    {
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                _ = self.closed.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("acp reader: EOF on agent stdout");
                    break;
                }
                Err(e) => {
                    warn!("acp reader: stdout read error: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    debug!("acp reader: non-JSON stdout line skipped: {e}");
                    continue;
                }
            };

            let has_id = value.get("id").is_some_and(|id| !id.is_null());
            let is_reply = value.get("result").is_some() || value.get("error").is_some();
            let method = value.get("method").and_then(Value::as_str);

            if has_id && is_reply {
                self.resolve_reply(&value);
            } else if let Some(method) = method {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                if has_id {
                    let id = value.get("id").cloned().unwrap_or(Value::Null);
                    self.dispatch_request(method.to_owned(), id, params, &on_request);
                } else {
                    on_notification(AcpNotification {
                        method: method.to_owned(),
                        params,
                        raw: Bytes::from(line),
                    });
                }
            } else {
                debug!("acp reader: unrecognized frame skipped");
            }
        }
    }

    fn resolve_reply(&self, value: &Value) {
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            debug!("acp reader: response with non-integer id skipped");
            return;
        };
        let Some(tx) = self.pending.lock().remove(&id) else {
            debug!(id, "acp reader: response without pending call");
            return;
        };
        let reply = if let Some(err) = value.get("error") {
            Err(AcpError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown agent error")
                    .to_owned(),
            })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(reply);
    }

    /// Run an agent → client request through the handler and write the reply
    /// back with the same id. Spawned so a slow handler (file IO) does not
    /// stall response dispatch.
    fn dispatch_request(
        self: &Arc<Self>,
        method: String,
        id: Value,
        params: Value,
        on_request: &RequestHandler,
    ) {
        let transport = Arc::clone(self);
        let handler = Arc::clone(on_request);
        tokio::spawn(async move {
            let reply = match handler(method, params).await {
                Ok(result) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result,
                }),
                Err(AcpError::Rpc { code, message }) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": code, "message": message },
                }),
                Err(other) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32603, "message": other.to_string() },
                }),
            };
            if let Err(e) = transport.write_value(&reply).await {
                debug!("acp: failed to write client reply: {e}");
            }
        });
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
