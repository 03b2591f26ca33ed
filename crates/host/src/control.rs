// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External collaborator interfaces consumed by the session host: control
//! plane, persistence, message reporting, telemetry, container resolution,
//! and agent installation. Every call here is best-effort from the host's
//! point of view: failures are logged, never allowed to stall the agent.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::extract::MessageRecord;
use crate::host::RestoreHint;

/// Per-agent settings fetched from the control plane.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Extra environment for the agent process.
    pub env: HashMap<String, String>,
    /// Extra command-line arguments appended to the agent command.
    pub args: Vec<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Env var name the credential is exported as.
    pub credential_env: Option<String>,
}

pub trait ControlPlane: Send + Sync {
    /// Fetch the agent credential; `None` means the control plane has none
    /// configured (HTTP 404).
    fn fetch_credential<'a>(
        &'a self,
        agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>>;

    fn fetch_settings<'a>(
        &'a self,
        agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<AgentSettings>>>;
}

/// Persistence of the session-id → workspace mapping. Best-effort.
pub trait SessionStore: Send + Sync {
    fn update_acp_session_id<'a>(
        &'a self,
        workspace_id: &'a str,
        session_id: &'a str,
        acp_session_id: &'a str,
        agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn update_tab_session<'a>(
        &'a self,
        tab_id: &'a str,
        acp_session_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn update_last_prompt<'a>(
        &'a self,
        workspace_id: &'a str,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Downstream sink for extracted chat messages. Must not block.
pub trait MessageReporter: Send + Sync {
    fn enqueue(&self, record: MessageRecord) -> anyhow::Result<()>;
}

/// Boot-step and error telemetry.
pub trait Telemetry: Send + Sync {
    fn boot_log(&self, step: &str, status: &str, msg: &str, detail: Option<&str>);
    fn report_error(&self, msg: &str, detail: &str);
    fn report_warn(&self, msg: &str, detail: &str);
    fn report_info(&self, msg: &str, detail: &str);
}

/// Workspace event stream.
pub trait EventAppender: Send + Sync {
    fn append_event(&self, workspace_id: &str, level: &str, kind: &str, msg: &str, detail: &str);
}

/// Locates the target container for agent spawns. Returns an empty id when
/// agents run directly on the node.
pub trait ContainerResolver: Send + Sync {
    fn resolve(&self) -> BoxFuture<'_, anyhow::Result<String>>;
}

pub trait GitTokenFetcher: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// On-demand agent binary installation inside the container. Idempotent
/// check-then-install.
pub trait AgentInstaller: Send + Sync {
    fn is_installed<'a>(&'a self, agent_type: &'a str) -> BoxFuture<'a, anyhow::Result<bool>>;
    fn install<'a>(&'a self, agent_type: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Invoked after an idle host auto-suspends, with the restore hint a future
/// host needs to attempt LoadSession.
pub type SuspendCallback = Arc<dyn Fn(&str, &str, RestoreHint) + Send + Sync>;

/// Invoked when a prompt turn finishes: `(stop_reason, error)`.
pub type PromptCompleteCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Bundle of collaborator handles handed to each session host.
#[derive(Clone)]
pub struct Hooks {
    pub control_plane: Arc<dyn ControlPlane>,
    pub sessions: Arc<dyn SessionStore>,
    pub reporter: Arc<dyn MessageReporter>,
    pub telemetry: Arc<dyn Telemetry>,
    pub events: Arc<dyn EventAppender>,
    pub containers: Arc<dyn ContainerResolver>,
    pub git_token: Option<Arc<dyn GitTokenFetcher>>,
    pub installer: Arc<dyn AgentInstaller>,
    pub on_suspend: SuspendCallback,
    pub on_prompt_complete: PromptCompleteCallback,
}

impl Default for Hooks {
    fn default() -> Self {
        let noop = Arc::new(Noop);
        Self {
            control_plane: noop.clone(),
            sessions: noop.clone(),
            reporter: noop.clone(),
            telemetry: noop.clone(),
            events: noop.clone(),
            containers: noop.clone(),
            git_token: None,
            installer: noop,
            on_suspend: Arc::new(|_, _, _| {}),
            on_prompt_complete: Arc::new(|_, _| {}),
        }
    }
}

// ── No-op collaborators ──────────────────────────────────────────────────────

/// Stand-in for absent collaborators: standalone deployments and tests.
pub struct Noop;

impl ControlPlane for Noop {
    fn fetch_credential<'a>(
        &'a self,
        _agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async { Ok(Some(String::new())) })
    }

    fn fetch_settings<'a>(
        &'a self,
        _agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<AgentSettings>>> {
        Box::pin(async { Ok(None) })
    }
}

impl SessionStore for Noop {
    fn update_acp_session_id<'a>(
        &'a self,
        _workspace_id: &'a str,
        _session_id: &'a str,
        _acp_session_id: &'a str,
        _agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn update_tab_session<'a>(
        &'a self,
        _tab_id: &'a str,
        _acp_session_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn update_last_prompt<'a>(
        &'a self,
        _workspace_id: &'a str,
        _session_id: &'a str,
        _text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl MessageReporter for Noop {
    fn enqueue(&self, _record: MessageRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Telemetry for Noop {
    fn boot_log(&self, _step: &str, _status: &str, _msg: &str, _detail: Option<&str>) {}
    fn report_error(&self, _msg: &str, _detail: &str) {}
    fn report_warn(&self, _msg: &str, _detail: &str) {}
    fn report_info(&self, _msg: &str, _detail: &str) {}
}

impl EventAppender for Noop {
    fn append_event(&self, _ws: &str, _level: &str, _kind: &str, _msg: &str, _detail: &str) {}
}

impl ContainerResolver for Noop {
    fn resolve(&self) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async { Ok(String::new()) })
    }
}

impl AgentInstaller for Noop {
    fn is_installed<'a>(&'a self, _agent_type: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn install<'a>(&'a self, _agent_type: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Resolves to a fixed container id from configuration.
pub struct FixedContainer(pub String);

impl ContainerResolver for FixedContainer {
    fn resolve(&self) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

// ── HTTP control plane ───────────────────────────────────────────────────────

/// Control-plane client: bearer-authenticated HTTP, 404 → missing.
pub struct HttpControlPlane {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CredentialBody {
    credential: String,
}

impl HttpControlPlane {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { base_url, token, client }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl ControlPlane for HttpControlPlane {
    fn fetch_credential<'a>(
        &'a self,
        agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            let resp = self.get(&format!("/api/v1/agents/{agent_type}/credential")).send().await?;
            if resp.status().as_u16() == 404 {
                return Ok(None);
            }
            let body: CredentialBody = resp.error_for_status()?.json().await?;
            Ok(Some(body.credential))
        })
    }

    fn fetch_settings<'a>(
        &'a self,
        agent_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<AgentSettings>>> {
        Box::pin(async move {
            let resp = self.get(&format!("/api/v1/agents/{agent_type}/settings")).send().await?;
            if resp.status().as_u16() == 404 {
                return Ok(None);
            }
            let body: AgentSettings = resp.error_for_status()?.json().await?;
            Ok(Some(body))
        })
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
