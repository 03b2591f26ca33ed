// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Prompt lifecycle: the at-most-one prompt gate, synthetic user-message
//! echo, the timeout watchdog, cancellation, and force-stop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp;
use crate::error::ErrorCode;
use crate::frames::{rpc_error, rpc_result, AgentPhase, ControlFrame, HostStatus};
use crate::host::SessionHost;

/// Persisted prompt preview length.
const LAST_PROMPT_CHARS: usize = 200;

impl SessionHost {
    /// Run one prompt turn on behalf of a viewer. `req_id` is the viewer's
    /// JSON-RPC id; results and errors are broadcast to every attached
    /// viewer so all tabs stay consistent.
    pub async fn handle_prompt(self: &Arc<Self>, req_id: Value, params: Value, viewer_id: &str) {
        let (transport, session_id) = {
            let state = self.state.lock();
            match (&state.transport, state.acp_session_id.is_empty()) {
                (Some(transport), false) => {
                    (Arc::clone(transport), state.acp_session_id.clone())
                }
                _ => {
                    drop(state);
                    self.broadcast(
                        rpc_error(
                            &req_id,
                            ErrorCode::NoSession,
                            "no agent session; select an agent first",
                        ),
                        true,
                    );
                    return;
                }
            }
        };

        let blocks: Vec<Value> = params
            .get("prompt")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if blocks.is_empty() {
            self.broadcast(
                rpc_error(
                    &req_id,
                    ErrorCode::InvalidParams,
                    "prompt must contain at least one content block",
                ),
                true,
            );
            return;
        }

        let texts: Vec<String> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str).map(str::to_owned))
            .collect();

        let preview: String = texts.join("\n").chars().take(LAST_PROMPT_CHARS).collect();
        if let Err(e) = self
            .hooks
            .sessions
            .update_last_prompt(&self.opts.workspace_id, &self.opts.session_id, &preview)
            .await
        {
            warn!("persist last prompt failed: {e:#}");
        }

        // The agent echoes user input only during LoadSession replay, never
        // during a live prompt; synthesize the user bubbles into the
        // broadcast stream so a reloading viewer sees them.
        for text in &texts {
            self.synthesize_user_chunk(&session_id, text);
        }

        {
            let mut table = self.viewers.lock();
            if let Some(timer) = table.suspend_timer.take() {
                timer.cancel();
            }
        }

        {
            let mut in_flight = self.prompt_in_flight.lock();
            if *in_flight {
                drop(in_flight);
                self.broadcast(
                    rpc_error(&req_id, ErrorCode::PromptBusy, "a prompt is already in flight"),
                    true,
                );
                return;
            }
            *in_flight = true;
        }

        let prompt_id = self.prompt_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        {
            let mut slot = self.prompt_slot.lock();
            slot.active_id = prompt_id;
            slot.cancel = Some(cancel.clone());
        }

        // Watchdog: hard prompt deadline. Stands down on CancelPrompt (the
        // grace-period force-stop takes over) and on normal return.
        let returned = CancellationToken::new();
        {
            let host = Arc::clone(self);
            let req_id = req_id.clone();
            let returned = returned.clone();
            let timeout = self.opts.prompt_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!(prompt_id, "prompt deadline elapsed, force-stopping agent");
                        host.force_stop(prompt_id, "prompt timed out").await;
                        host.broadcast(
                            rpc_error(&req_id, ErrorCode::PromptTimeout, "prompt timed out"),
                            true,
                        );
                    }
                    _ = cancel.cancelled() => {}
                    _ = returned.cancelled() => {}
                }
            });
        }

        self.broadcast_control(&ControlFrame::SessionPrompting {});
        {
            let mut state = self.state.lock();
            if state.status != HostStatus::Stopped {
                state.status = HostStatus::Prompting;
            }
        }
        debug!(prompt_id, viewer_id, "prompt started");

        let result = acp::prompt(&transport, &session_id, &blocks).await;
        returned.cancel();

        // Release the gate only if this prompt is still the active one; a
        // force-stop already released it (and may have admitted a new
        // prompt).
        let still_active = {
            let mut slot = self.prompt_slot.lock();
            if slot.active_id == prompt_id {
                slot.active_id = 0;
                slot.cancel = None;
                true
            } else {
                false
            }
        };
        if !still_active {
            debug!(prompt_id, "prompt returned after force-stop, discarding result");
            return;
        }
        *self.prompt_in_flight.lock() = false;

        match result {
            Ok(value) => {
                {
                    let mut state = self.state.lock();
                    if state.status == HostStatus::Prompting {
                        state.status = HostStatus::Ready;
                    }
                }
                self.broadcast_control(&ControlFrame::SessionPromptDone {});
                self.broadcast(rpc_result(&req_id, &value), true);
                let stop_reason = value
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .unwrap_or("end_turn")
                    .to_owned();
                (self.hooks.on_prompt_complete)(&stop_reason, None);
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    if state.status == HostStatus::Prompting {
                        state.status = HostStatus::Ready;
                    }
                }
                self.broadcast_control(&ControlFrame::SessionPromptDone {});
                let message = e.to_string();
                self.broadcast(rpc_error(&req_id, ErrorCode::Internal, &message), true);
                (self.hooks.on_prompt_complete)("error", Some(&message));
            }
        }
    }

    fn synthesize_user_chunk(&self, session_id: &str, text: &str) {
        let note = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": session_id,
                "update": {
                    "sessionUpdate": "user_message_chunk",
                    "content": { "type": "text", "text": text },
                },
            },
        });
        self.broadcast(serde_json::to_vec(&note).map(Bytes::from).unwrap_or_default(), false);

        let record = crate::extract::MessageRecord {
            message_id: String::new(),
            role: crate::extract::Role::User,
            content: text.to_owned(),
            tool_metadata: None,
        };
        if let Err(e) = self.hooks.reporter.enqueue(record) {
            warn!("message reporter enqueue failed: {e:#}");
        }
    }

    /// Ask the agent to abort the current turn with a `session/cancel`
    /// notification. A cooperative agent finishes the pending prompt with a
    /// cancelled stop reason; an uncooperative one is handled by the
    /// force-stop fallback armed in [`cancel_prompt`](Self::cancel_prompt).
    pub async fn send_cancel_to_agent(&self) {
        let (transport, session_id) = {
            let state = self.state.lock();
            match (&state.transport, state.acp_session_id.is_empty()) {
                (Some(transport), false) => {
                    (Arc::clone(transport), state.acp_session_id.clone())
                }
                _ => return,
            }
        };
        if let Err(e) = acp::send_cancel(&transport, &session_id).await {
            debug!("session/cancel to agent failed: {e}");
        }
    }

    /// Cancel the in-flight prompt, if any. Cooperative cancellation goes to
    /// the agent via `session/cancel`; this arms the bounded fallback that
    /// hard-stops an agent that ignores it.
    pub fn cancel_prompt(self: &Arc<Self>) {
        let (cancel, prompt_id) = {
            let slot = self.prompt_slot.lock();
            (slot.cancel.clone(), slot.active_id)
        };
        let Some(cancel) = cancel else {
            return;
        };
        cancel.cancel();

        let host = Arc::clone(self);
        let grace = self.opts.prompt_cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            host.force_stop(prompt_id, "agent did not honor cancellation").await;
        });
    }

    /// Hard-stop the prompt identified by `prompt_id`: release the gate,
    /// transition to error, and kill the subprocess. No-op when that prompt
    /// is no longer active.
    pub(crate) async fn force_stop(&self, prompt_id: u64, reason: &str) {
        {
            let mut slot = self.prompt_slot.lock();
            if slot.active_id != prompt_id {
                return;
            }
            slot.active_id = 0;
            slot.cancel = None;
        }
        *self.prompt_in_flight.lock() = false;

        let (process, transport) = {
            let mut state = self.state.lock();
            if state.status == HostStatus::Prompting {
                state.status = HostStatus::Error;
                state.status_err = reason.to_owned();
            }
            (state.process.take(), state.transport.take())
        };
        warn!(prompt_id, reason, "force-stopping agent");
        self.shutdown_agent(transport, process).await;

        self.broadcast_control(&ControlFrame::SessionPromptDone {});
        self.broadcast_control(&self.agent_status_frame(AgentPhase::Error, Some(reason.to_owned())));
    }
}
