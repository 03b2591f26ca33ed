// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-viewer WebSocket relay: classifies inbound frames, routes them to the
//! session host, and tracks liveness.
//!
//! Two heartbeat layers coexist. Protocol-level ping/pong keeps the socket
//! read deadline fresh; the application-level `{"type":"ping"}` /
//! `{"type":"pong"}` exchange exists because some intermediaries strip
//! protocol control frames or do not count them as activity.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth;
use crate::frames::{classify, ControlRequest, InboundFrame};
use crate::host::SessionHost;
use crate::run::App;
use crate::viewer::ViewerSink;

/// Query parameters for the viewer WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub workspace: String,
    pub tab: String,
    pub token: Option<String>,
}

/// `GET /ws` — viewer WebSocket upgrade.
pub async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if auth::validate_ws_token(query.token.as_deref(), app.auth_token.as_deref()).is_err() {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    let host = app.registry.get_or_create(&query.workspace, &query.tab);
    let ping_interval = app.ping_interval;
    let pong_timeout = app.pong_timeout;
    ws.on_upgrade(move |socket| handle_connection(host, socket, ping_interval, pong_timeout))
        .into_response()
}

/// Sink half of the viewer socket, owned by the viewer's write loop.
struct WsSink(SplitSink<WebSocket, Message>);

impl ViewerSink for WsSink {
    fn send_text(&mut self, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let text = String::from_utf8(data.to_vec())?;
            self.0.send(Message::Text(text.into())).await?;
            Ok(())
        })
    }

    fn send_ping(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.0.send(Message::Ping(Bytes::new())).await?;
            Ok(())
        })
    }

    fn send_going_away(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.0
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: axum::extract::ws::close_code::AWAY,
                    reason: "session closed".into(),
                })))
                .await?;
            Ok(())
        })
    }
}

/// Per-connection relay loop.
async fn handle_connection(
    host: Arc<SessionHost>,
    socket: WebSocket,
    ping_interval: std::time::Duration,
    pong_timeout: std::time::Duration,
) {
    let viewer_id = uuid::Uuid::new_v4().to_string();
    let (ws_tx, ws_rx) = socket.split();

    let Some(viewer) =
        host.attach_viewer(viewer_id.clone(), Box::new(WsSink(ws_tx))).await
    else {
        // Host already stopped; the socket closes when the halves drop.
        return;
    };
    info!(viewer_id, "viewer attached");

    // The blocking socket read must coexist with the viewer's done signal
    // and the host context, so reads run in their own task feeding a
    // channel the main loop can select over.
    let (read_tx, mut read_rx) = mpsc::channel(16);
    let reader = tokio::spawn(pump_reads(ws_rx, read_tx));

    let shutdown = host.shutdown_token();
    let read_window = ping_interval + pong_timeout;
    let mut deadline = tokio::time::Instant::now() + read_window;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = viewer.done.cancelled() => {
                // Write pump failed or the host detached us; exit now
                // instead of waiting out the read deadline on a dead socket.
                debug!(viewer_id, "viewer done signalled, leaving read loop");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!(viewer_id, "viewer read deadline exceeded");
                break;
            }
            item = read_rx.recv() => {
                match item {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Pong(_))) => {
                        deadline = tokio::time::Instant::now() + read_window;
                    }
                    Some(Ok(Message::Text(text))) => {
                        deadline = tokio::time::Instant::now() + read_window;
                        dispatch_frame(&host, &viewer_id, text.as_str()).await;
                    }
                    // Binary frames are not part of the protocol; protocol
                    // pings are answered by axum automatically.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    reader.abort();
    host.detach_viewer(&viewer_id);
    info!(viewer_id, "viewer detached");
}

async fn pump_reads(
    mut ws_rx: SplitStream<WebSocket>,
    read_tx: mpsc::Sender<Result<Message, axum::Error>>,
) {
    while let Some(item) = ws_rx.next().await {
        if read_tx.send(item).await.is_err() {
            break;
        }
    }
}

/// Route one inbound text frame.
async fn dispatch_frame(host: &Arc<SessionHost>, viewer_id: &str, text: &str) {
    match classify(text) {
        Ok(InboundFrame::Control(ControlRequest::SelectAgent { agent_type })) => {
            let host = Arc::clone(host);
            tokio::spawn(async move {
                host.select_agent(&agent_type).await;
            });
        }
        Ok(InboundFrame::Control(ControlRequest::Ping {})) => {
            host.send_pong(viewer_id);
        }
        Ok(InboundFrame::Rpc(frame)) => match frame.method.as_deref() {
            Some("session/prompt") => {
                let host = Arc::clone(host);
                let viewer_id = viewer_id.to_owned();
                tokio::spawn(async move {
                    host.handle_prompt(frame.id, frame.params, &viewer_id).await;
                });
            }
            Some("session/cancel") => {
                host.cancel_prompt();
                // The agent gets the cancel too, addressed to the host's own
                // session id, so it can abort the running turn.
                host.send_cancel_to_agent().await;
            }
            _ => host.forward_to_agent(frame.raw).await,
        },
        Err(e) => debug!(viewer_id, "unparseable frame dropped: {e}"),
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
