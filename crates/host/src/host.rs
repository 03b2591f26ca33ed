// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session host: the per-chat-tab runtime that owns one agent subprocess,
//! its ACP transport, a bounded replay buffer, and the attached viewers.
//!
//! Lock discipline (never held across await points):
//! - `state`: status, agent identity, process/transport handles
//! - `viewers`: viewer map and the idle-suspend timer
//! - `buffer`: replay buffer and its sequence counter
//! - `prompt_in_flight` / `prompt_slot`: the prompt gate and the active
//!   prompt's cancellation handle; independent locks so CancelPrompt never
//!   waits behind a long-held state lock.
//!
//! Ordering when several are taken: state > viewers > buffer; the prompt
//! locks are leaves, released before any broadcast.

#[path = "host/lifecycle.rs"]
mod lifecycle;
#[path = "host/prompt.rs"]
mod prompt;
#[path = "host/select.rs"]
mod select;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::types::{PermissionRequestParams, ReadTextFileParams, WriteTextFileParams};
use crate::acp::{AcpError, AcpNotification, AcpTransport};
use crate::buffer::ReplayBuffer;
use crate::control::Hooks;
use crate::frames::{ControlFrame, HostStatus};
use crate::proc::{AgentProcess, SpawnSpec};
use crate::viewer::{run_write_loop, PriorityOutcome, SendQueue, Viewer, ViewerSink};

/// Identity preserved across suspend so a future host can attempt
/// LoadSession. Mixing sessions across agent types is incorrect, so the
/// agent type travels with the session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreHint {
    pub acp_session_id: String,
    pub agent_type: String,
}

/// Permission handling mode applied to agent permission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
    DontAsk,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "acceptEdits" => Self::AcceptEdits,
            "bypassPermissions" => Self::BypassPermissions,
            "plan" => Self::Plan,
            "dontAsk" => Self::DontAsk,
            _ => Self::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
            Self::DontAsk => "dontAsk",
        }
    }

    /// Whether permission requests are answered affirmatively without a
    /// human in the loop.
    pub fn auto_allows(&self) -> bool {
        matches!(self, Self::AcceptEdits | Self::BypassPermissions | Self::DontAsk)
    }
}

/// How agent processes are launched for this host.
#[derive(Debug, Clone)]
pub struct SpawnTemplate {
    pub container_cmd: String,
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// agentType → command line.
    pub agents: HashMap<String, Vec<String>>,
    pub stop_grace: Duration,
    pub stop_timeout: Duration,
}

impl Default for SpawnTemplate {
    fn default() -> Self {
        Self {
            container_cmd: "docker".to_owned(),
            user: None,
            workdir: None,
            agents: HashMap::new(),
            stop_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Host construction parameters. Defaults match the documented
/// configuration table.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub workspace_id: String,
    pub session_id: String,
    pub message_buffer_size: usize,
    pub viewer_send_buffer: usize,
    pub ping_interval: Duration,
    pub init_timeout: Duration,
    pub prompt_timeout: Duration,
    pub prompt_cancel_grace: Duration,
    /// Zero disables idle auto-suspend.
    pub idle_suspend_timeout: Duration,
    pub max_restart_attempts: u32,
    pub file_max_size: usize,
    pub replay_send_timeout: Duration,
    pub restart_delay: Duration,
    pub rapid_exit_window: Duration,
    pub spawn: SpawnTemplate,
    /// Identity of a suspended predecessor, if any.
    pub restore: Option<RestoreHint>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            workspace_id: String::new(),
            session_id: String::new(),
            message_buffer_size: 5000,
            viewer_send_buffer: 256,
            ping_interval: Duration::from_secs(30),
            init_timeout: Duration::from_secs(30),
            prompt_timeout: Duration::from_secs(3600),
            prompt_cancel_grace: Duration::from_secs(5),
            idle_suspend_timeout: Duration::ZERO,
            max_restart_attempts: 3,
            file_max_size: 1024 * 1024,
            replay_send_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            rapid_exit_window: Duration::from_secs(5),
            spawn: SpawnTemplate::default(),
            restore: None,
        }
    }
}

pub(crate) struct HostState {
    pub(crate) status: HostStatus,
    pub(crate) agent_type: String,
    pub(crate) acp_session_id: String,
    pub(crate) restart_count: u32,
    pub(crate) status_err: String,
    pub(crate) permission_mode: PermissionMode,
    pub(crate) process: Option<Arc<AgentProcess>>,
    pub(crate) transport: Option<Arc<AcpTransport>>,
}

pub(crate) struct ViewerTable {
    pub(crate) viewers: HashMap<String, Viewer>,
    pub(crate) suspend_timer: Option<CancellationToken>,
}

pub(crate) struct PromptSlot {
    pub(crate) active_id: u64,
    pub(crate) cancel: Option<CancellationToken>,
}

pub struct SessionHost {
    pub(crate) opts: HostOptions,
    pub(crate) hooks: Arc<Hooks>,
    /// Root context; cancelled on Stop/Suspend, unblocking every write loop.
    pub(crate) shutdown: CancellationToken,
    pub(crate) state: Mutex<HostState>,
    pub(crate) viewers: Mutex<ViewerTable>,
    pub(crate) buffer: Mutex<ReplayBuffer>,
    pub(crate) prompt_in_flight: Mutex<bool>,
    pub(crate) prompt_slot: Mutex<PromptSlot>,
    pub(crate) prompt_seq: AtomicU64,
}

impl SessionHost {
    pub fn new(opts: HostOptions, hooks: Arc<Hooks>) -> Arc<Self> {
        let buffer = ReplayBuffer::new(opts.message_buffer_size);
        Arc::new(Self {
            opts,
            hooks,
            shutdown: CancellationToken::new(),
            state: Mutex::new(HostState {
                status: HostStatus::Idle,
                agent_type: String::new(),
                acp_session_id: String::new(),
                restart_count: 0,
                status_err: String::new(),
                permission_mode: PermissionMode::Default,
                process: None,
                transport: None,
            }),
            viewers: Mutex::new(ViewerTable { viewers: HashMap::new(), suspend_timer: None }),
            buffer: Mutex::new(buffer),
            prompt_in_flight: Mutex::new(false),
            prompt_slot: Mutex::new(PromptSlot { active_id: 0, cancel: None }),
            prompt_seq: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> HostStatus {
        self.state.lock().status
    }

    pub fn agent_type(&self) -> String {
        self.state.lock().agent_type.clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.state.lock().restart_count
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().viewers.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ── Viewer attach / detach ───────────────────────────────────────────

    /// Attach a viewer: register it, spawn its write loop, and deliver the
    /// attach sequence of `session_state` with the pending replay count, the
    /// buffered replay itself, `session_replay_complete`, and a second
    /// `session_state` with replayCount 0. The second snapshot covers status
    /// changes that happened during replay and lets the browser leave replay
    /// mode without re-entering it.
    ///
    /// Returns `None` when the host is already stopped.
    pub async fn attach_viewer(
        self: &Arc<Self>,
        id: String,
        sink: Box<dyn ViewerSink>,
    ) -> Option<Viewer> {
        if self.status() == HostStatus::Stopped {
            return None;
        }

        let queue = Arc::new(SendQueue::new(self.opts.viewer_send_buffer));
        let done = CancellationToken::new();
        let viewer = Viewer { id: id.clone(), queue: Arc::clone(&queue), done: done.clone() };

        tokio::spawn(run_write_loop(
            id.clone(),
            Arc::clone(&queue),
            done,
            self.shutdown.clone(),
            sink,
            self.opts.ping_interval,
        ));

        {
            let mut table = self.viewers.lock();
            if let Some(timer) = table.suspend_timer.take() {
                timer.cancel();
            }
            table.viewers.insert(id.clone(), viewer.clone());
        }

        let snapshot = self.buffer.lock().snapshot();

        // The queue is fresh here, so the pre-replay state frame cannot be
        // evicted or dropped.
        self.push_priority_to(&viewer, self.session_state_frame(snapshot.len()).to_bytes());

        let mut delivered = 0usize;
        for msg in &snapshot {
            if !queue.push_replay(msg.data.clone(), self.opts.replay_send_timeout).await {
                warn!(
                    viewer = %id,
                    delivered,
                    dropped = snapshot.len() - delivered,
                    "replay aborted: viewer send timed out"
                );
                break;
            }
            delivered += 1;
        }

        // The trailing frames use the bounded blocking send as well: a
        // priority push here could evict the replay tail still queued.
        for frame in [
            ControlFrame::SessionReplayComplete {}.to_bytes(),
            self.session_state_frame(0).to_bytes(),
        ] {
            if !queue.push_replay(frame, self.opts.replay_send_timeout).await {
                warn!(viewer = %id, "attach frame dropped: viewer send timed out");
            }
        }

        Some(viewer)
    }

    /// Remove a viewer and signal its `done`. Arms the idle-suspend timer
    /// when the last viewer leaves and auto-suspend is enabled.
    pub fn detach_viewer(self: &Arc<Self>, id: &str) {
        let mut table = self.viewers.lock();
        if let Some(viewer) = table.viewers.remove(id) {
            viewer.done.cancel();
        }
        if table.viewers.is_empty()
            && self.opts.idle_suspend_timeout > Duration::ZERO
            && table.suspend_timer.is_none()
        {
            self.arm_suspend_timer(&mut table);
        }
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    /// Append to the replay buffer and fan out to every viewer. Priority
    /// affects only the per-viewer send policy, never retention.
    pub fn broadcast(&self, data: Bytes, priority: bool) {
        let seq = self.buffer.lock().append(data.clone());
        let viewers: Vec<Viewer> = self.viewers.lock().viewers.values().cloned().collect();
        for viewer in viewers {
            if priority {
                match viewer.queue.push_priority(data.clone()) {
                    PriorityOutcome::Dropped => {
                        warn!(viewer = %viewer.id, seq, "priority frame dropped: queue full")
                    }
                    PriorityOutcome::EvictedThenQueued => {
                        debug!(viewer = %viewer.id, seq, "priority frame evicted a queued frame")
                    }
                    PriorityOutcome::Queued => {}
                }
            } else if !viewer.queue.try_push(data.clone()) {
                debug!(viewer = %viewer.id, seq, "frame dropped: queue full, viewer can replay");
            }
        }
    }

    pub fn broadcast_control(&self, frame: &ControlFrame) {
        self.broadcast(frame.to_bytes(), true);
    }

    /// Application-level keepalive reply, delivered as a data frame so it
    /// tunnels through intermediaries that strip protocol control frames.
    pub fn send_pong(&self, viewer_id: &str) {
        let viewer = self.viewers.lock().viewers.get(viewer_id).cloned();
        if let Some(viewer) = viewer {
            self.push_priority_to(&viewer, ControlFrame::Pong {}.to_bytes());
        }
    }

    fn push_priority_to(&self, viewer: &Viewer, data: Bytes) {
        if viewer.queue.push_priority(data) == PriorityOutcome::Dropped {
            warn!(viewer = %viewer.id, "direct frame dropped: queue full");
        }
    }

    pub(crate) fn session_state_frame(&self, replay_count: usize) -> ControlFrame {
        let state = self.state.lock();
        ControlFrame::SessionState {
            status: state.status,
            agent_type: if state.agent_type.is_empty() {
                None
            } else {
                Some(state.agent_type.clone())
            },
            error: if state.status_err.is_empty() { None } else { Some(state.status_err.clone()) },
            replay_count,
        }
    }

    pub(crate) fn agent_status_frame(
        &self,
        status: crate::frames::AgentPhase,
        error: Option<String>,
    ) -> ControlFrame {
        ControlFrame::AgentStatus { status, agent_type: self.agent_type(), error }
    }

    // ── Agent plumbing ───────────────────────────────────────────────────

    /// Forward a raw viewer JSON-RPC frame to the agent's stdin.
    pub async fn forward_to_agent(&self, raw: Bytes) {
        let transport = self.state.lock().transport.clone();
        match transport {
            Some(transport) => {
                if let Err(e) = transport.write_raw(&raw).await {
                    debug!("forward to agent failed: {e}");
                }
            }
            None => debug!("frame for agent dropped: no transport bound"),
        }
    }

    /// Bind an ACP transport over the given pipes, wiring agent
    /// notifications into the broadcast stream and agent requests into the
    /// client-op handler. Handlers hold a weak host reference; the host owns
    /// the transport, not the other way around.
    pub(crate) fn attach_transport<R, W>(self: &Arc<Self>, stdout: R, stdin: W) -> Arc<AcpTransport>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let weak = Arc::downgrade(self);
        let on_notification: crate::acp::NotificationHandler = Arc::new(move |note| {
            if let Some(host) = weak.upgrade() {
                host.on_agent_notification(note);
            }
        });

        let weak = Arc::downgrade(self);
        let on_request: crate::acp::RequestHandler = Arc::new(move |method, params| {
            let host = weak.upgrade();
            Box::pin(async move {
                match host {
                    Some(host) => host.on_agent_request(&method, params).await,
                    None => Err(AcpError::method_not_supported(&method)),
                }
            })
        });

        AcpTransport::spawn(stdout, stdin, on_notification, on_request)
    }

    /// Relay an agent notification to all viewers and feed the message
    /// extractor.
    fn on_agent_notification(&self, note: AcpNotification) {
        let is_update = note.method == "session/update";
        let params = note.params;
        self.broadcast(note.raw, false);

        if is_update {
            match serde_json::from_value(params) {
                Ok(update) => {
                    for record in crate::extract::extract(&update) {
                        if let Err(e) = self.hooks.reporter.enqueue(record) {
                            warn!("message reporter enqueue failed: {e:#}");
                        }
                    }
                }
                Err(e) => debug!("unparseable session/update skipped by extractor: {e}"),
            }
        }
    }

    /// Client-callable ACP methods: file read/write (capped) and permission
    /// requests. Anything else is not supported.
    async fn on_agent_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AcpError> {
        match method {
            "fs/read_text_file" => {
                let req: ReadTextFileParams = serde_json::from_value(params)
                    .map_err(|e| AcpError::invalid_params(e.to_string()))?;
                self.read_text_file(&req).await
            }
            "fs/write_text_file" => {
                let req: WriteTextFileParams = serde_json::from_value(params)
                    .map_err(|e| AcpError::invalid_params(e.to_string()))?;
                self.write_text_file(&req).await
            }
            "session/request_permission" => {
                let req: PermissionRequestParams = serde_json::from_value(params.clone())
                    .map_err(|e| AcpError::invalid_params(e.to_string()))?;
                // Surface the request to every viewer before answering.
                let frame = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "session/request_permission",
                    "params": params,
                });
                self.broadcast(
                    serde_json::to_vec(&frame).map(Bytes::from).unwrap_or_default(),
                    true,
                );
                Ok(self.answer_permission(&req))
            }
            other => Err(AcpError::method_not_supported(other)),
        }
    }

    fn answer_permission(&self, req: &PermissionRequestParams) -> serde_json::Value {
        let mode = self.state.lock().permission_mode;
        if mode.auto_allows() {
            let allow = req
                .options
                .iter()
                .find(|o| o.kind.starts_with("allow"))
                .or_else(|| req.options.first());
            if let Some(option) = allow {
                return serde_json::json!({
                    "outcome": { "outcome": "selected", "optionId": option.option_id },
                });
            }
        }
        serde_json::json!({ "outcome": { "outcome": "cancelled" } })
    }

    async fn read_text_file(
        &self,
        req: &ReadTextFileParams,
    ) -> Result<serde_json::Value, AcpError> {
        let path = self.resolve_path(&req.path);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| AcpError::internal(format!("read {}: {e}", req.path)))?;
        if meta.len() > self.opts.file_max_size as u64 {
            return Err(AcpError::invalid_params(format!(
                "file exceeds {} byte limit",
                self.opts.file_max_size
            )));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AcpError::internal(format!("read {}: {e}", req.path)))?;
        let content = match (req.line, req.limit) {
            (None, None) => content,
            (line, limit) => {
                let start = line.map(|l| l.saturating_sub(1)).unwrap_or(0);
                let lines: Vec<&str> = content.lines().collect();
                let end = limit.map_or(lines.len(), |n| (start + n).min(lines.len()));
                if start >= lines.len() {
                    String::new()
                } else {
                    lines[start..end].join("\n")
                }
            }
        };
        Ok(serde_json::json!({ "content": content }))
    }

    async fn write_text_file(
        &self,
        req: &WriteTextFileParams,
    ) -> Result<serde_json::Value, AcpError> {
        if req.content.len() > self.opts.file_max_size {
            return Err(AcpError::invalid_params(format!(
                "content exceeds {} byte limit",
                self.opts.file_max_size
            )));
        }
        let path = self.resolve_path(&req.path);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(&path, &req.content)
            .await
            .map_err(|e| AcpError::internal(format!("write {}: {e}", req.path)))?;
        Ok(serde_json::json!({}))
    }

    fn resolve_path(&self, path: &str) -> std::path::PathBuf {
        let p = std::path::Path::new(path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match &self.opts.spawn.workdir {
            Some(dir) => std::path::Path::new(dir).join(p),
            None => p.to_path_buf(),
        }
    }

    // ── Spawn specification ─────────────────────────────────────────────

    pub(crate) fn spawn_spec(
        &self,
        container: String,
        command: Vec<String>,
        env: Vec<(String, String)>,
    ) -> SpawnSpec {
        SpawnSpec {
            container_cmd: self.opts.spawn.container_cmd.clone(),
            container,
            user: self.opts.spawn.user.clone(),
            workdir: self.opts.spawn.workdir.clone(),
            env,
            command,
            stop_grace: self.opts.spawn.stop_grace,
            stop_timeout: self.opts.spawn.stop_timeout,
        }
    }

    /// Bind a live transport and session identity directly; used by tests
    /// that stub the agent end of the pipes.
    pub(crate) fn bind_agent_for_tests(
        &self,
        transport: Arc<AcpTransport>,
        acp_session_id: &str,
        agent_type: &str,
    ) {
        let mut state = self.state.lock();
        state.transport = Some(transport);
        state.acp_session_id = acp_session_id.to_owned();
        state.agent_type = agent_type.to_owned();
        state.status = HostStatus::Ready;
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
