// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `perch` binary as a subprocess and exercises it over
//! HTTP and WebSocket, with the `mock-agent` binary standing in for a real
//! ACP agent.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

pub use perch::run::ensure_crypto;

/// Resolve the path to a compiled workspace binary.
fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

pub fn perch_binary() -> PathBuf {
    workspace_binary("perch")
}

pub fn mock_agent_binary() -> PathBuf {
    workspace_binary("mock-agent")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `perch` process, killed on drop.
pub struct PerchProcess {
    child: Child,
    port: u16,
    auth_token: Option<String>,
    _workdir: tempfile::TempDir,
}

/// Builder for configuring the spawned server.
#[derive(Default)]
pub struct PerchBuilder {
    auth_token: Option<String>,
    idle_suspend_secs: Option<u64>,
    extra_args: Vec<String>,
}

impl PerchBuilder {
    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    pub fn idle_suspend_secs(mut self, secs: u64) -> Self {
        self.idle_suspend_secs = Some(secs);
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.extra_args.push(arg.to_owned());
        self
    }

    pub fn spawn(self) -> anyhow::Result<PerchProcess> {
        ensure_crypto();
        let binary = perch_binary();
        anyhow::ensure!(binary.exists(), "perch binary not found at {}", binary.display());
        let mock = mock_agent_binary();
        anyhow::ensure!(mock.exists(), "mock-agent binary not found at {}", mock.display());

        let port = free_port()?;
        let workdir = tempfile::tempdir()?;

        let mut args: Vec<String> = vec![
            "--port".into(),
            port.to_string(),
            "--host".into(),
            "127.0.0.1".into(),
            "--workdir".into(),
            workdir.path().to_string_lossy().into_owned(),
            "--agent".into(),
            format!("mock={}", mock.display()),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        if let Some(ref token) = self.auth_token {
            args.extend(["--auth-token".into(), token.clone()]);
        }
        if let Some(secs) = self.idle_suspend_secs {
            args.extend(["--idle-suspend-timeout-secs".into(), secs.to_string()]);
        }
        args.extend(self.extra_args);

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(PerchProcess { child, port, auth_token: self.auth_token, _workdir: workdir })
    }
}

impl PerchProcess {
    pub fn build() -> PerchBuilder {
        PerchBuilder::default()
    }

    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// WebSocket URL for one viewer connection.
    pub fn ws_url(&self, workspace: &str, tab: &str) -> String {
        let mut url = format!("ws://127.0.0.1:{}/ws?workspace={workspace}&tab={tab}", self.port);
        if let Some(ref token) = self.auth_token {
            url.push_str(&format!("&token={token}"));
        }
        url
    }

    /// Poll health until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("perch did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for PerchProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
