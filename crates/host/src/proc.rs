// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent subprocess supervisor.
//!
//! Spawns the agent through a container-exec command (or directly when no
//! container is configured), in its own process group so the whole tree can
//! be signalled with a negative-pgid kill, and stops it with a bounded
//! SIGTERM → SIGKILL escalation.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Bytes of agent stderr retained for crash reports.
const STDERR_CAP: usize = 4096;

/// How the agent process is launched and stopped.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Container exec tool (e.g. `docker`). Ignored when `container` is empty.
    pub container_cmd: String,
    /// Target container; empty spawns the command directly on the node.
    pub container: String,
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// Passed through the container-exec CLI (`-e KEY=VAL`), not the host
    /// environment.
    pub env: Vec<(String, String)>,
    pub command: Vec<String>,
    pub stop_grace: Duration,
    pub stop_timeout: Duration,
}

/// Exit status of the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "exited".to_owned(),
        }
    }
}

/// Capped ring of recent stderr output, kept for crash-report context.
#[derive(Debug, Default)]
struct StderrTail {
    buf: Mutex<VecDeque<u8>>,
}

impl StderrTail {
    fn push(&self, chunk: &[u8]) {
        let mut buf = self.buf.lock();
        buf.extend(chunk.iter().copied());
        while buf.len() > STDERR_CAP {
            buf.pop_front();
        }
    }

    fn tail(&self, max_chars: usize) -> String {
        let buf = self.buf.lock();
        let bytes: Vec<u8> = buf.iter().copied().collect();
        let text = String::from_utf8_lossy(&bytes);
        let chars: Vec<char> = text.chars().collect();
        let start = chars.len().saturating_sub(max_chars);
        chars[start..].iter().collect()
    }
}

/// A running agent subprocess. Stdio pipes are handed to the ACP transport
/// at spawn time; the supervisor keeps the pid, the stderr tail, and an exit
/// watch shared by `wait` and `stop`.
pub struct AgentProcess {
    pid: i32,
    started_at: Instant,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    stderr: Arc<StderrTail>,
    stop_grace: Duration,
    stop_timeout: Duration,
}

impl AgentProcess {
    /// Spawn the agent and return the supervisor together with the stdio
    /// pipes the transport binds to.
    pub fn spawn(spec: &SpawnSpec) -> anyhow::Result<(Arc<Self>, ChildStdin, ChildStdout)> {
        anyhow::ensure!(!spec.command.is_empty(), "agent command is empty");

        let mut cmd = if spec.container.is_empty() {
            let mut cmd = Command::new(&spec.command[0]);
            cmd.args(&spec.command[1..]);
            for (key, val) in &spec.env {
                cmd.env(key, val);
            }
            if let Some(ref dir) = spec.workdir {
                cmd.current_dir(dir);
            }
            cmd
        } else {
            let mut cmd = Command::new(&spec.container_cmd);
            cmd.arg("exec").arg("-i");
            if let Some(ref user) = spec.user {
                cmd.arg("-u").arg(user);
            }
            if let Some(ref dir) = spec.workdir {
                cmd.arg("-w").arg(dir);
            }
            for (key, val) in &spec.env {
                cmd.arg("-e").arg(format!("{key}={val}"));
            }
            cmd.arg(&spec.container);
            cmd.args(&spec.command);
            cmd
        };

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!("spawn agent command {:?}", spec.command.first())
        })?;
        let pid = child.id().map(|p| p as i32).context("spawned agent has no pid")?;

        let stdin = child.stdin.take().context("capture agent stdin")?;
        let stdout = child.stdout.take().context("capture agent stdout")?;
        let stderr_pipe = child.stderr.take().context("capture agent stderr")?;

        let stderr = Arc::new(StderrTail::default());
        {
            let tail = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut pipe = stderr_pipe;
                let mut buf = vec![0u8; 1024];
                loop {
                    match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => tail.push(&buf[..n]),
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus { code: status.code(), signal: status.signal() },
                Err(e) => {
                    warn!(pid, "wait on agent process failed: {e}");
                    ExitStatus { code: None, signal: None }
                }
            };
            debug!(pid, status = %status.describe(), "agent process exited");
            let _ = exit_tx.send(Some(status));
        });

        let process = Arc::new(Self {
            pid,
            started_at: Instant::now(),
            exit_rx,
            stderr,
            stop_grace: spec.stop_grace,
            stop_timeout: spec.stop_timeout,
        });
        Ok((process, stdin, stdout))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Last captured stderr, truncated to `max_chars`.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        self.stderr.tail(max_chars)
    }

    /// Exit status if the process has already exited.
    pub fn try_exit(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to exit. Safe to call concurrently with `stop`.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                return ExitStatus { code: None, signal: None };
            }
        }
    }

    async fn wait_with_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(status) => Some(status),
            Err(_) => None,
        }
    }

    /// Stop the process: SIGTERM to the process group, wait up to the grace
    /// period, then SIGKILL, bounded overall by the stop timeout. Stdin is
    /// closed by the caller dropping the transport beforehand, giving a
    /// cooperative agent the chance to exit on EOF first.
    ///
    /// Idempotent; errors only when the process is still alive after the
    /// full timeout.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if self.try_exit().is_some() {
            return Ok(());
        }
        let deadline = Instant::now() + self.stop_timeout;

        self.signal_group(Signal::SIGTERM);
        let grace = self.stop_grace.min(self.stop_timeout);
        if self.wait_with_timeout(grace).await.is_some() {
            return Ok(());
        }

        debug!(pid = self.pid, "agent ignored SIGTERM, sending SIGKILL to process group");
        self.signal_group(Signal::SIGKILL);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.wait_with_timeout(remaining).await.is_some() {
            return Ok(());
        }

        anyhow::bail!("stop-timeout: agent process {} still running after SIGKILL", self.pid)
    }

    fn signal_group(&self, signal: Signal) {
        // Negative pid signals the whole process group.
        if let Err(e) = kill(Pid::from_raw(-self.pid), signal) {
            debug!(pid = self.pid, %signal, "signal to process group failed: {e}");
        }
    }
}

#[cfg(test)]
#[path = "proc_tests.rs"]
mod tests;
