//! Process-wide registry of supervised processes, for introspection only;
//! nothing in the supervision engine depends on it for correctness.
//!
//! The default is one process-wide instance behind a `LazyLock`; tests (or
//! embedders wanting isolation) inject their own via
//! [`crate::SupervisorConfig::registry`]. Supervisors register on start and
//! unregister when they terminate.

use crate::state::lock;
use crate::supervisor::Shared;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

/// Snapshot of one still-running supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveProcess {
    pub pid: u32,
    pub command: String,
    pub started_at: Option<DateTime<Utc>>,
    pub running_for: Option<Duration>,
    /// Time since the last output line; a large value on a long-running
    /// process is the classic hung-subprocess signature.
    pub since_last_line: Option<Duration>,
}

/// Thread-safe registry of currently supervised processes.
pub struct SupervisorRegistry {
    entries: Mutex<Vec<Arc<Shared>>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        SupervisorRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide default instance.
    pub fn global() -> &'static Arc<SupervisorRegistry> {
        static GLOBAL: LazyLock<Arc<SupervisorRegistry>> =
            LazyLock::new(|| Arc::new(SupervisorRegistry::new()));
        &GLOBAL
    }

    pub(crate) fn register(&self, shared: Arc<Shared>) {
        let mut entries = lock(&self.entries);
        if !entries.iter().any(|e| Arc::ptr_eq(e, &shared)) {
            entries.push(shared);
        }
    }

    pub(crate) fn unregister(&self, shared: &Shared) {
        lock(&self.entries).retain(|e| !std::ptr::eq(Arc::as_ptr(e), shared as *const Shared));
    }

    /// Snapshots of every registered process not yet in a terminal state.
    pub fn list_active(&self) -> Vec<ActiveProcess> {
        lock(&self.entries)
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| snapshot(e))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Drop entries whose process has reached a terminal state. Normal
    /// termination paths unregister themselves; this catches stragglers.
    pub fn cleanup_finished(&self) {
        lock(&self.entries).retain(|e| !e.state.is_terminal());
    }

    /// Log every still-active process; the hung-pipeline debugging aid.
    pub fn dump_active(&self) {
        let active = self.list_active();
        if active.is_empty() {
            tracing::warn!("no active supervised processes");
            return;
        }
        tracing::warn!(count = active.len(), "active supervised processes");
        for (idx, process) in active.iter().enumerate() {
            tracing::warn!(
                idx = idx + 1,
                pid = process.pid,
                command = %process.command,
                running_secs = process.running_for.unwrap_or_default().as_secs_f64(),
                idle_secs = process.since_last_line.unwrap_or_default().as_secs_f64(),
                "active process"
            );
        }
    }
}

impl Default for SupervisorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(shared: &Shared) -> ActiveProcess {
    ActiveProcess {
        pid: shared.pid(),
        command: shared.command_line.clone(),
        started_at: shared.started_wall(),
        running_for: shared.running_for(),
        since_last_line: shared.idle_for(),
    }
}
