// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host lifecycle: stop and suspend, the idle auto-suspend timer, and the
//! crash monitor with its restart loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acp::AcpTransport;
use crate::frames::{AgentPhase, HostStatus};
use crate::host::{RestoreHint, SessionHost, ViewerTable};
use crate::proc::{AgentProcess, ExitStatus};
use crate::viewer::Viewer;

/// Stderr excerpt length attached to crash reports.
const CRASH_STDERR_CHARS: usize = 500;

impl SessionHost {
    /// Stop the host: terminal. Stops the subprocess, cancels the root
    /// context (unblocking every viewer write loop, which send GoingAway
    /// close frames), and removes all viewers. Idempotent.
    pub async fn stop(&self) {
        self.stop_inner().await;
    }

    /// Like [`stop`](Self::stop) but returns the session identity so the
    /// owner can construct a future host that attempts LoadSession. `None`
    /// when the host was already stopped or never had a session.
    pub async fn suspend(&self) -> Option<RestoreHint> {
        let hint = {
            let state = self.state.lock();
            if state.acp_session_id.is_empty() {
                None
            } else {
                Some(RestoreHint {
                    acp_session_id: state.acp_session_id.clone(),
                    agent_type: state.agent_type.clone(),
                })
            }
        };
        if self.stop_inner().await {
            hint
        } else {
            None
        }
    }

    /// Shared stop path; returns `false` when the host was already stopped.
    async fn stop_inner(&self) -> bool {
        let (process, transport) = {
            let mut state = self.state.lock();
            if state.status == HostStatus::Stopped {
                return false;
            }
            state.status = HostStatus::Stopped;
            (state.process.take(), state.transport.take())
        };

        {
            let mut table = self.viewers.lock();
            if let Some(timer) = table.suspend_timer.take() {
                timer.cancel();
            }
        }

        // Release the prompt gate so a blocked HandlePrompt return path and
        // any pending force-stop fallback both turn into no-ops.
        {
            let mut slot = self.prompt_slot.lock();
            slot.active_id = 0;
            slot.cancel = None;
        }
        *self.prompt_in_flight.lock() = false;

        self.shutdown.cancel();
        self.shutdown_agent(transport, process).await;

        let drained: Vec<Viewer> = {
            let mut table = self.viewers.lock();
            table.viewers.drain().map(|(_, viewer)| viewer).collect()
        };
        for viewer in drained {
            viewer.done.cancel();
        }

        info!(session_id = %self.opts.session_id, "session host stopped");
        true
    }

    /// Tear down the agent in shutdown order: transport first (closing
    /// stdin, which unblocks any pending ACP call with a closed error), then
    /// the subprocess with its bounded signal escalation.
    pub(crate) async fn shutdown_agent(
        &self,
        transport: Option<Arc<AcpTransport>>,
        process: Option<Arc<AgentProcess>>,
    ) {
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(process) = process {
            if let Err(e) = process.stop().await {
                error!("agent process stop failed: {e:#}");
            }
        }
    }

    /// Transition to the error state, stop the subprocess, and tell viewers.
    pub(crate) async fn fail_agent(&self, reason: &str) {
        let (process, transport) = {
            let mut state = self.state.lock();
            if state.status == HostStatus::Stopped {
                return;
            }
            state.status = HostStatus::Error;
            state.status_err = reason.to_owned();
            (state.process.take(), state.transport.take())
        };
        self.shutdown_agent(transport, process).await;
        self.hooks.events.append_event(
            &self.opts.workspace_id,
            "error",
            "agent",
            "agent entered error state",
            reason,
        );
        self.broadcast_control(
            &self.agent_status_frame(AgentPhase::Error, Some(reason.to_owned())),
        );
    }

    // ── Idle auto-suspend ────────────────────────────────────────────────

    /// Arm the idle-suspend timer. Caller holds the viewer lock.
    pub(crate) fn arm_suspend_timer(self: &Arc<Self>, table: &mut ViewerTable) {
        let token = CancellationToken::new();
        table.suspend_timer = Some(token.clone());

        let host = Arc::clone(self);
        let timeout = self.opts.idle_suspend_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => host.auto_suspend(&token).await,
            }
        });
        debug!(session_id = %self.opts.session_id, "idle suspend timer armed");
    }

    /// Timer tick: suspend the host unless a viewer re-attached, the timer
    /// was superseded, or a prompt is running (in which case re-arm; never
    /// interrupt active work).
    async fn auto_suspend(self: &Arc<Self>, token: &CancellationToken) {
        {
            let mut table = self.viewers.lock();
            // Cancellation happens under the viewer lock, so a cancelled
            // token here means another flow already owns the timer slot.
            if token.is_cancelled() {
                return;
            }
            table.suspend_timer = None;
            if !table.viewers.is_empty() {
                return;
            }
        }

        if self.status() == HostStatus::Prompting {
            let mut table = self.viewers.lock();
            if table.viewers.is_empty() && table.suspend_timer.is_none() {
                self.arm_suspend_timer(&mut table);
            }
            return;
        }

        info!(session_id = %self.opts.session_id, "idle timeout reached, suspending");
        if let Some(hint) = self.suspend().await {
            self.hooks.events.append_event(
                &self.opts.workspace_id,
                "info",
                "session",
                "session suspended after idle timeout",
                "",
            );
            (self.hooks.on_suspend)(&self.opts.workspace_id, &self.opts.session_id, hint);
        }
    }

    // ── Crash monitor ────────────────────────────────────────────────────

    /// Watch the subprocess and drive crash classification / restart once
    /// it exits.
    pub(crate) fn spawn_exit_monitor(self: &Arc<Self>, process: Arc<AgentProcess>, agent_type: String) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let exit = process.wait().await;
            host.handle_agent_exit(process, agent_type, exit).await;
        });
    }

    async fn handle_agent_exit(
        self: Arc<Self>,
        process: Arc<AgentProcess>,
        agent_type: String,
        exit: ExitStatus,
    ) {
        let uptime = process.uptime();
        let rapid = uptime < self.opts.rapid_exit_window;

        if rapid {
            // Report before any ownership check so crash data survives races
            // with concurrent cleanup.
            let stderr = process.stderr_tail(CRASH_STDERR_CHARS);
            self.hooks.telemetry.report_error(
                "agent crashed during startup",
                &format!("agent={agent_type} uptime={uptime:?} {}: {stderr}", exit.describe()),
            );
        }

        {
            let state = self.state.lock();
            match &state.process {
                Some(current) if Arc::ptr_eq(current, &process) => {}
                // Replaced by another flow (restart, new SelectAgent, or a
                // stop that already took the handle); that flow owns cleanup.
                _ => return,
            }
            if state.status == HostStatus::Stopped {
                return;
            }
        }

        if rapid {
            let stderr = process.stderr_tail(CRASH_STDERR_CHARS);
            let reason = if stderr.is_empty() {
                format!("agent {} after {uptime:?}", exit.describe())
            } else {
                format!("agent {} after {uptime:?}: {stderr}", exit.describe())
            };
            self.fail_agent(&reason).await;
            return;
        }

        let attempts = {
            let mut state = self.state.lock();
            state.restart_count += 1;
            state.restart_count
        };
        if attempts > self.opts.max_restart_attempts {
            self.hooks.telemetry.report_error(
                "agent restart budget exhausted",
                &format!("agent={agent_type} attempts={attempts}"),
            );
            self.fail_agent(&format!(
                "agent crashed {attempts} times; giving up (last exit: {})",
                exit.describe()
            ))
            .await;
            return;
        }

        warn!(
            agent_type,
            attempt = attempts,
            exit = %exit.describe(),
            "agent exited, restarting"
        );
        self.broadcast_control(&self.agent_status_frame(AgentPhase::Restarting, None));
        {
            let mut state = self.state.lock();
            state.process = None;
            state.transport = None;
            state.acp_session_id.clear();
            state.status = HostStatus::Starting;
        }
        tokio::time::sleep(self.opts.restart_delay).await;

        // Fresh session on restart: the crashed agent's in-memory state is
        // gone, so LoadSession would replay into a void.
        if let Err(e) = self.start_agent(&agent_type, None, true).await {
            self.hooks.telemetry.report_error("agent restart failed", &format!("{e:#}"));
            self.fail_agent(&format!("{e:#}")).await;
        }
    }
}
