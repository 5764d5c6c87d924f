//! Background worker that enforces global and stale-output deadlines
//! independently of whatever the caller is doing.
//!
//! Worst-case detection latency is one polling interval. The watchdog also
//! reaps a naturally-exited child, so completion is detected even when the
//! caller never polls.

use crate::state::ProcessState;
use crate::supervisor::Shared;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    /// The absolute deadline (`started + timeout`) passed.
    Global,
    /// No line arrived within the rolling stale-output window.
    Stale,
}

/// Compare `now` against the configured deadlines. Global wins when both
/// are breached in the same tick.
pub(crate) fn deadline_breached(
    now: Instant,
    started: Instant,
    last_line: Option<Instant>,
    timeout: Option<Duration>,
    stale_timeout: Option<Duration>,
) -> Option<TimeoutKind> {
    if let Some(timeout) = timeout {
        if now.duration_since(started) > timeout {
            return Some(TimeoutKind::Global);
        }
    }
    if let Some(stale) = stale_timeout {
        let last_activity = last_line.unwrap_or(started);
        if now.duration_since(last_activity) > stale {
            return Some(TimeoutKind::Stale);
        }
    }
    None
}

pub(crate) struct Watchdog {
    shared: Arc<Shared>,
}

impl Watchdog {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Watchdog { shared }
    }

    pub(crate) async fn run(self) {
        let shared = self.shared;
        let mut tick = tokio::time::interval(shared.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            if shared.state.is_terminal() {
                break;
            }
            if shared.try_reap().is_some() {
                break;
            }
            let Some(started) = shared.started_instant() else {
                continue;
            };
            let breach = deadline_breached(
                Instant::now(),
                started,
                shared.last_line_instant(),
                shared.timeout,
                shared.stale_timeout,
            );
            if let Some(kind) = breach {
                // The commit is the tie-break: if natural completion or an
                // explicit kill got there first, this watchdog does nothing.
                if shared.state.try_commit(ProcessState::TimedOut) {
                    let info = shared.process_info();
                    let kind = match kind {
                        TimeoutKind::Global => "global",
                        TimeoutKind::Stale => "stale-output",
                    };
                    tracing::warn!(
                        pid = info.pid,
                        command = %info.command,
                        elapsed_secs = info.duration.as_secs_f64(),
                        kind,
                        "process timeout breached, killing"
                    );
                    shared.fire_on_timeout(info);
                    shared.ensure_terminated().await;
                }
                break;
            }
        }
        tracing::trace!("watchdog exited");
    }
}
