//! Process state machine and the shared shutdown signal.
//!
//! Every state transition in the crate goes through [`StateCell::try_commit`],
//! which is the single point of mutual exclusion the three actors (caller,
//! output reader, watchdog) race on. Terminal states are sticky: the first
//! commit wins and all later attempts are no-ops.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a supervised process.
///
/// `Completed`, `TimedOut`, `Killed` and `Failed` are terminal: once one of
/// them is committed the state never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    /// Configured but not yet started.
    Created,
    /// Spawned; workers are running.
    Running,
    /// Exited on its own with the given code (negative = killed by signal).
    Completed(i32),
    /// The watchdog breached a global or stale-output deadline.
    TimedOut,
    /// Termination was requested by the caller.
    Killed,
    /// The process could not be spawned.
    Failed(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Created | ProcessState::Running)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Created => write!(f, "created"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Completed(code) => write!(f, "completed({code})"),
            ProcessState::TimedOut => write!(f, "timed-out"),
            ProcessState::Killed => write!(f, "killed"),
            ProcessState::Failed(msg) => write!(f, "failed({msg})"),
        }
    }
}

/// The one guarded transition point for [`ProcessState`].
pub(crate) struct StateCell {
    slot: Mutex<ProcessState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell {
            slot: Mutex::new(ProcessState::Created),
        }
    }

    pub(crate) fn get(&self) -> ProcessState {
        lock(&self.slot).clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        lock(&self.slot).is_terminal()
    }

    /// Attempt a transition. Returns `false` without touching the state when
    /// a terminal state has already been committed.
    pub(crate) fn try_commit(&self, next: ProcessState) -> bool {
        let mut slot = lock(&self.slot);
        if slot.is_terminal() {
            tracing::debug!(current = %*slot, refused = %next, "state transition refused");
            return false;
        }
        tracing::debug!(from = %*slot, to = %next, "state transition");
        *slot = next;
        true
    }
}

/// Cooperative shutdown flag shared by the caller and both workers.
///
/// Workers check it at every suspension point, so a signal is observed within
/// one polling interval.
pub(crate) struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Shutdown {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Suspend until `signal()` is called. Returns immediately if it already
    /// was.
    pub(crate) async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.is_signalled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}
