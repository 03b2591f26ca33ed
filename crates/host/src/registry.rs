// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owner of session hosts: one per `(workspace, tab)` key, created on first
//! viewer attach. Suspended hosts leave a restore hint behind so the next
//! host for the same key attempts LoadSession.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::control::Hooks;
use crate::frames::HostStatus;
use crate::host::{HostOptions, RestoreHint, SessionHost};

struct RegistryInner {
    hosts: HashMap<String, Arc<SessionHost>>,
    restore: HashMap<String, RestoreHint>,
}

pub struct HostRegistry {
    inner: Mutex<RegistryInner>,
    base: HostOptions,
    hooks: Hooks,
    weak_self: Mutex<Weak<HostRegistry>>,
}

/// Per-host snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub key: String,
    pub status: HostStatus,
    pub agent_type: String,
    pub viewers: usize,
    pub buffered: usize,
    pub restarts: u32,
}

fn host_key(workspace_id: &str, tab_id: &str) -> String {
    format!("{workspace_id}/{tab_id}")
}

impl HostRegistry {
    pub fn new(base: HostOptions, hooks: Hooks) -> Arc<Self> {
        let registry = Arc::new(Self {
            inner: Mutex::new(RegistryInner { hosts: HashMap::new(), restore: HashMap::new() }),
            base,
            hooks,
            weak_self: Mutex::new(Weak::new()),
        });
        *registry.weak_self.lock() = Arc::downgrade(&registry);
        registry
    }

    /// Fetch the live host for a key, or construct one (consuming any
    /// retained restore hint). A stopped host is replaced.
    pub fn get_or_create(&self, workspace_id: &str, tab_id: &str) -> Arc<SessionHost> {
        let key = host_key(workspace_id, tab_id);
        let mut inner = self.inner.lock();

        if let Some(host) = inner.hosts.get(&key) {
            if host.status() != HostStatus::Stopped {
                return Arc::clone(host);
            }
        }

        let mut opts = self.base.clone();
        opts.workspace_id = workspace_id.to_owned();
        opts.session_id = tab_id.to_owned();
        opts.restore = inner.restore.remove(&key);

        let host = SessionHost::new(opts, Arc::new(self.hooks_for(&key)));
        info!(key, "session host created");
        inner.hosts.insert(key, Arc::clone(&host));
        host
    }

    /// Host hooks with suspend wired back into the registry: the suspended
    /// host is released and its identity retained for the next attach.
    fn hooks_for(&self, key: &str) -> Hooks {
        let mut hooks = self.hooks.clone();
        let outer = Arc::clone(&hooks.on_suspend);
        let weak = self.weak_self.lock().clone();
        let key = key.to_owned();
        hooks.on_suspend = Arc::new(move |workspace_id, session_id, hint: RestoreHint| {
            if let Some(registry) = weak.upgrade() {
                let mut inner = registry.inner.lock();
                inner.restore.insert(key.clone(), hint.clone());
                inner.hosts.remove(&key);
            }
            outer(workspace_id, session_id, hint);
        });
        hooks
    }

    pub fn host_count(&self) -> usize {
        self.inner.lock().hosts.len()
    }

    pub fn viewer_count(&self) -> usize {
        let hosts: Vec<Arc<SessionHost>> =
            self.inner.lock().hosts.values().cloned().collect();
        hosts.iter().map(|h| h.viewer_count()).sum()
    }

    pub fn snapshot(&self) -> Vec<HostSummary> {
        let hosts: Vec<(String, Arc<SessionHost>)> = {
            let inner = self.inner.lock();
            inner.hosts.iter().map(|(k, h)| (k.clone(), Arc::clone(h))).collect()
        };
        hosts
            .into_iter()
            .map(|(key, host)| HostSummary {
                key,
                status: host.status(),
                agent_type: host.agent_type(),
                viewers: host.viewer_count(),
                buffered: host.buffered_count(),
                restarts: host.restart_count(),
            })
            .collect()
    }

    /// Stop every host (node shutdown).
    pub async fn stop_all(&self) {
        let hosts: Vec<Arc<SessionHost>> = {
            let mut inner = self.inner.lock();
            inner.hosts.drain().map(|(_, host)| host).collect()
        };
        for host in hosts {
            host.stop().await;
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
