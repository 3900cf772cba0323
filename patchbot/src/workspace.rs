//! Project workspaces and the process-wide registry.
//!
//! A workspace pairs one project id with one sandbox and, after the first
//! clone, the path of the cloned fork inside it. The registry owns the
//! id-to-workspace mapping; expiry is sweep-driven with an injected clock so
//! eviction is deterministic and testable without real timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::io::sandbox::Sandbox;

/// Time source injected into the registry.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One project's durable environment plus the path of its cloned fork.
#[derive(Clone)]
pub struct Workspace {
    pub project_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    repo_path: Arc<Mutex<Option<String>>>,
}

impl Workspace {
    pub fn new(project_id: impl Into<String>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            project_id: project_id.into(),
            sandbox,
            repo_path: Arc::new(Mutex::new(None)),
        }
    }

    /// Path of the cloned fork, once a clone has happened.
    pub fn repo_path(&self) -> Option<String> {
        self.repo_path.lock().expect("repo path mutex poisoned").clone()
    }

    pub fn set_repo_path(&self, path: impl Into<String>) {
        *self.repo_path.lock().expect("repo path mutex poisoned") = Some(path.into());
    }
}

struct Entry {
    workspace: Workspace,
    last_used: Instant,
}

/// Registry mapping project ids to workspaces with time-based expiry.
///
/// Mutation points are exactly [`WorkspaceRegistry::get_or_create`],
/// [`WorkspaceRegistry::evict`], and [`WorkspaceRegistry::sweep_expired`].
/// There are no background timers; callers drive sweeps.
pub struct WorkspaceRegistry {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl WorkspaceRegistry {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the project's workspace or create one with `make_sandbox`.
    /// Either way the workspace's idle timer restarts.
    pub fn get_or_create(
        &self,
        project_id: &str,
        make_sandbox: impl FnOnce() -> Result<Arc<dyn Sandbox>>,
    ) -> Result<Workspace> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(project_id) {
            entry.last_used = self.clock.now();
            debug!(project_id, "reusing workspace");
            return Ok(entry.workspace.clone());
        }
        let sandbox = make_sandbox()?;
        let workspace = Workspace::new(project_id, sandbox);
        info!(project_id, "created workspace");
        entries.insert(
            project_id.to_string(),
            Entry {
                workspace: workspace.clone(),
                last_used: self.clock.now(),
            },
        );
        Ok(workspace)
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.lock().contains_key(project_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop a workspace and tear its sandbox down (best effort).
    pub fn evict(&self, project_id: &str) -> bool {
        let removed = self.lock().remove(project_id);
        match removed {
            Some(entry) => {
                kill_sandbox(&entry.workspace);
                info!(project_id, "evicted workspace");
                true
            }
            None => false,
        }
    }

    /// Evict every workspace idle past the TTL; returns the evicted ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<(String, Entry)> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_used) >= self.ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let mut evicted: Vec<String> = Vec::with_capacity(expired.len());
        for (id, entry) in expired {
            kill_sandbox(&entry.workspace);
            info!(project_id = %id, "expired workspace evicted");
            evicted.push(id);
        }
        evicted.sort();
        evicted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("registry mutex poisoned")
    }
}

fn kill_sandbox(workspace: &Workspace) {
    if let Err(err) = workspace.sandbox.kill() {
        warn!(project_id = %workspace.project_id, error = %err, "sandbox cleanup failed");
    }
}
