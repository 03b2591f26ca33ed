// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;

use crate::host::{HostOptions, SpawnTemplate};

/// Agent session host for workspace containers.
#[derive(Debug, Clone, Parser)]
#[command(name = "perch", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "PERCH_PORT", default_value = "8080")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "PERCH_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bearer token for API authentication (also accepted as ?token= on the
    /// WebSocket upgrade).
    #[arg(long, env = "PERCH_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Container exec tool (docker, podman, nerdctl).
    #[arg(long, env = "PERCH_CONTAINER_CMD", default_value = "docker")]
    pub container_cmd: String,

    /// Target container name or id. Empty spawns agents directly on the node.
    #[arg(long, env = "PERCH_CONTAINER", default_value = "")]
    pub container: String,

    /// User to run agents as inside the container.
    #[arg(long, env = "PERCH_CONTAINER_USER")]
    pub container_user: Option<String>,

    /// Working directory for agent sessions.
    #[arg(long, env = "PERCH_WORKDIR")]
    pub workdir: Option<String>,

    /// Agent command table entries of the form `type=command [args...]`.
    #[arg(long = "agent", env = "PERCH_AGENTS", value_delimiter = ',')]
    pub agents: Vec<String>,

    /// Control plane base URL. Empty runs standalone (no credential fetch).
    #[arg(long, env = "PERCH_CONTROL_PLANE_URL", default_value = "")]
    pub control_plane_url: String,

    /// Bearer token for control plane requests.
    #[arg(long, env = "PERCH_CONTROL_PLANE_TOKEN")]
    pub control_plane_token: Option<String>,

    /// Transport-level ping cadence in seconds.
    #[arg(long, env = "PERCH_PING_INTERVAL_SECS", default_value = "30")]
    pub ping_interval_secs: u64,

    /// Read-deadline slack after an expected pong, in seconds.
    #[arg(long, env = "PERCH_PONG_TIMEOUT_SECS", default_value = "10")]
    pub pong_timeout_secs: u64,

    /// Bound on the agent handshake (initialize + session setup), seconds.
    #[arg(long, env = "PERCH_INIT_TIMEOUT_SECS", default_value = "30")]
    pub init_timeout_secs: u64,

    /// Hard deadline on a single prompt, in seconds.
    #[arg(long, env = "PERCH_PROMPT_TIMEOUT_SECS", default_value = "3600")]
    pub prompt_timeout_secs: u64,

    /// Delay before force-stop after a prompt cancellation, in milliseconds.
    #[arg(long, env = "PERCH_PROMPT_CANCEL_GRACE_MS", default_value = "5000")]
    pub prompt_cancel_grace_ms: u64,

    /// SIGTERM → SIGKILL gap when stopping agents, in seconds.
    #[arg(long, env = "PERCH_STOP_GRACE_SECS", default_value = "5")]
    pub stop_grace_secs: u64,

    /// Total bound on stopping an agent subprocess, in seconds.
    #[arg(long, env = "PERCH_STOP_TIMEOUT_SECS", default_value = "10")]
    pub stop_timeout_secs: u64,

    /// Replay buffer capacity in messages.
    #[arg(long, env = "PERCH_MESSAGE_BUFFER_SIZE", default_value = "5000")]
    pub message_buffer_size: usize,

    /// Per-viewer send queue capacity in frames.
    #[arg(long, env = "PERCH_VIEWER_SEND_BUFFER", default_value = "256")]
    pub viewer_send_buffer: usize,

    /// Crash-restart budget per agent selection.
    #[arg(long, env = "PERCH_MAX_RESTART_ATTEMPTS", default_value = "3")]
    pub max_restart_attempts: u32,

    /// Auto-suspend a viewerless host after this many seconds (0 disables).
    #[arg(long, env = "PERCH_IDLE_SUSPEND_TIMEOUT_SECS", default_value = "0")]
    pub idle_suspend_timeout_secs: u64,

    /// Size cap on ACP file read/write methods, in bytes.
    #[arg(long, env = "PERCH_FILE_MAX_BYTES", default_value = "1048576")]
    pub file_max_bytes: usize,

    /// Log format (json or text).
    #[arg(long, env = "PERCH_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PERCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.agent_table()?;
        if self.message_buffer_size == 0 {
            anyhow::bail!("--message-buffer-size must be positive");
        }
        if self.viewer_send_buffer == 0 {
            anyhow::bail!("--viewer-send-buffer must be positive");
        }
        Ok(())
    }

    /// Parse the `type=command args...` agent entries.
    pub fn agent_table(&self) -> anyhow::Result<HashMap<String, Vec<String>>> {
        let mut table = HashMap::new();
        for entry in &self.agents {
            let (name, command) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("invalid agent entry (want type=command): {entry}"))?;
            let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
            if name.is_empty() || argv.is_empty() {
                anyhow::bail!("invalid agent entry (want type=command): {entry}");
            }
            table.insert(name.to_owned(), argv);
        }
        Ok(table)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    /// Base host options shared by every session host this server creates.
    pub fn host_options(&self) -> anyhow::Result<HostOptions> {
        Ok(HostOptions {
            message_buffer_size: self.message_buffer_size,
            viewer_send_buffer: self.viewer_send_buffer,
            ping_interval: self.ping_interval(),
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            prompt_timeout: Duration::from_secs(self.prompt_timeout_secs),
            prompt_cancel_grace: Duration::from_millis(self.prompt_cancel_grace_ms),
            idle_suspend_timeout: Duration::from_secs(self.idle_suspend_timeout_secs),
            max_restart_attempts: self.max_restart_attempts,
            file_max_size: self.file_max_bytes,
            spawn: SpawnTemplate {
                container_cmd: self.container_cmd.clone(),
                user: self.container_user.clone(),
                workdir: self.workdir.clone(),
                agents: self.agent_table()?,
                stop_grace: Duration::from_secs(self.stop_grace_secs),
                stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            },
            ..HostOptions::default()
        })
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
