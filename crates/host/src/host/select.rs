// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent selection and startup: credential fetch, binary install, spawn,
//! ACP handshake, and session restore-or-create.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::acp;
use crate::frames::{AgentPhase, HostStatus};
use crate::host::{RestoreHint, SessionHost};
use crate::proc::AgentProcess;

impl SessionHost {
    /// Switch this host to the given agent, stopping any current subprocess
    /// first. Broadcasts lifecycle frames as the flow progresses; on failure
    /// the host lands in the error state and a later SelectAgent may retry.
    pub async fn select_agent(self: &Arc<Self>, agent_type: &str) {
        let (previous, old_process, old_transport) = {
            let mut state = self.state.lock();
            if state.status == HostStatus::Stopped {
                return;
            }
            let previous = if state.acp_session_id.is_empty() {
                self.opts.restore.clone()
            } else {
                Some(RestoreHint {
                    acp_session_id: state.acp_session_id.clone(),
                    agent_type: state.agent_type.clone(),
                })
            };
            state.status = HostStatus::Starting;
            state.status_err.clear();
            state.restart_count = 0;
            state.agent_type = agent_type.to_owned();
            state.acp_session_id.clear();
            (previous, state.process.take(), state.transport.take())
        };

        self.shutdown_agent(old_transport, old_process).await;
        self.broadcast_control(&self.agent_status_frame(AgentPhase::Starting, None));

        // Restoring a session from a different agent type is incorrect;
        // only resume when the identity matches the request.
        let restore = previous
            .filter(|hint| hint.agent_type == agent_type && !hint.acp_session_id.is_empty());

        if let Err(e) = self.start_agent(agent_type, restore, false).await {
            self.hooks.telemetry.report_error("agent start failed", &format!("{e:#}"));
            self.fail_agent(&format!("{e:#}")).await;
        }
    }

    /// Spawn the agent process, bind the transport, and run the handshake.
    /// Used by SelectAgent (with a possible restore hint) and by the
    /// crash-restart loop (always a fresh session; the agent's state died
    /// with it).
    pub(crate) async fn start_agent(
        self: &Arc<Self>,
        agent_type: &str,
        restore: Option<RestoreHint>,
        is_restart: bool,
    ) -> anyhow::Result<()> {
        let hooks = Arc::clone(&self.hooks);
        hooks.telemetry.boot_log("agent", "starting", agent_type, None);

        let credential = hooks
            .control_plane
            .fetch_credential(agent_type)
            .await
            .with_context(|| format!("fetch credential for agent {agent_type}"))?
            .ok_or_else(|| anyhow::anyhow!("no credential configured for agent {agent_type}"))?;

        let settings = hooks
            .control_plane
            .fetch_settings(agent_type)
            .await
            .with_context(|| format!("fetch settings for agent {agent_type}"))?
            .unwrap_or_default();

        if !hooks.installer.is_installed(agent_type).await.context("check agent install")? {
            self.broadcast_control(&self.agent_status_frame(AgentPhase::Installing, None));
            hooks.telemetry.boot_log("agent", "installing", agent_type, None);
            hooks.installer.install(agent_type).await.context("install agent binary")?;
        }

        let mut command = self
            .opts
            .spawn
            .agents
            .get(agent_type)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown agent type: {agent_type}"))?;
        command.extend(settings.args.iter().cloned());

        let mut env: Vec<(String, String)> =
            settings.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if !credential.is_empty() {
            let key = settings.credential_env.clone().unwrap_or_else(|| "AGENT_API_KEY".to_owned());
            env.push((key, credential));
        }
        if let Some(ref git) = hooks.git_token {
            match git.fetch().await {
                Ok(token) => env.push(("GIT_ACCESS_TOKEN".to_owned(), token)),
                Err(e) => warn!("git token fetch failed: {e:#}"),
            }
        }

        let container = hooks.containers.resolve().await.context("resolve container")?;
        let spec = self.spawn_spec(container, command, env);
        let (process, stdin, stdout) = AgentProcess::spawn(&spec)?;
        let transport = self.attach_transport(stdout, stdin);

        let stopped_during_start = {
            let mut state = self.state.lock();
            if state.status == HostStatus::Stopped {
                true
            } else {
                if let Some(ref mode) = settings.permission_mode {
                    state.permission_mode = crate::host::PermissionMode::parse(mode);
                }
                state.process = Some(Arc::clone(&process));
                state.transport = Some(Arc::clone(&transport));
                false
            }
        };
        if stopped_during_start {
            self.shutdown_agent(Some(transport), Some(process)).await;
            anyhow::bail!("host stopped during agent start");
        }
        self.spawn_exit_monitor(Arc::clone(&process), agent_type.to_owned());

        // Initialize plus session setup share one handshake deadline.
        let restore = if is_restart { None } else { restore };
        let cwd = self.opts.spawn.workdir.clone().unwrap_or_else(|| ".".to_owned());
        let handshake = async {
            let caps = acp::initialize(&transport, self.opts.init_timeout)
                .await
                .context("initialize agent")?;

            let session_id = match restore {
                Some(hint) if caps.load_session => {
                    match acp::load_session(&transport, &hint.acp_session_id, &cwd).await {
                        Ok(()) => {
                            info!(
                                acp_session_id = %hint.acp_session_id,
                                "restored previous agent session"
                            );
                            hint.acp_session_id
                        }
                        Err(e) => {
                            warn!("session restore failed, starting fresh: {e}");
                            acp::new_session(&transport, &cwd).await.context("create session")?
                        }
                    }
                }
                _ => acp::new_session(&transport, &cwd).await.context("create session")?,
            };
            Ok::<String, anyhow::Error>(session_id)
        };
        let session_id = tokio::time::timeout(self.opts.init_timeout, handshake)
            .await
            .map_err(|_| anyhow::anyhow!("agent handshake timed out"))??;

        if let Some(ref model) = settings.model {
            if let Err(e) = acp::set_session_model(&transport, &session_id, model).await {
                warn!("set_session_model failed: {e}");
            }
        }
        let mode = self.state.lock().permission_mode;
        if mode != crate::host::PermissionMode::Default {
            if let Err(e) = acp::set_session_mode(&transport, &session_id, mode.as_str()).await {
                warn!("set_session_mode failed: {e}");
            }
        }

        if let Err(e) = hooks
            .sessions
            .update_acp_session_id(
                &self.opts.workspace_id,
                &self.opts.session_id,
                &session_id,
                agent_type,
            )
            .await
        {
            warn!("persist acp session id failed: {e:#}");
        }
        if let Err(e) = hooks.sessions.update_tab_session(&self.opts.session_id, &session_id).await
        {
            warn!("persist tab session failed: {e:#}");
        }

        {
            let mut state = self.state.lock();
            if state.status == HostStatus::Stopped {
                drop(state);
                anyhow::bail!("host stopped during agent start");
            }
            state.acp_session_id = session_id;
            state.status = HostStatus::Ready;
        }
        self.broadcast_control(&self.agent_status_frame(AgentPhase::Ready, None));
        hooks.telemetry.boot_log("agent", "ready", agent_type, None);
        Ok(())
    }
}
