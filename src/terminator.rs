//! Process-tree termination capability.
//!
//! The supervisor spawns each child as its own process-group leader, so the
//! default implementation can reach every descendant with one group signal:
//! polite SIGTERM, a bounded grace period, then SIGKILL for survivors.

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Injectable capability that terminates a process and its descendants.
///
/// Implementations signal only; the supervisor reaps the root afterwards.
/// When no terminator is configured the supervisor falls back to killing the
/// root process alone and logs that descendants may be orphaned.
#[async_trait]
pub trait ProcessTreeTerminator: Send + Sync {
    /// Terminate the tree rooted at `pid`: request polite shutdown, wait
    /// briefly, then force-kill survivors.
    async fn terminate_tree(&self, pid: u32) -> io::Result<()>;
}

/// Grace period between SIGTERM and SIGKILL.
const DEFAULT_GRACE: Duration = Duration::from_millis(200);

/// POSIX process-group terminator: SIGTERM the group, wait, SIGKILL it.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct ProcessGroupTerminator {
    grace: Duration,
}

#[cfg(unix)]
impl ProcessGroupTerminator {
    pub fn new() -> Self {
        ProcessGroupTerminator {
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(grace: Duration) -> Self {
        ProcessGroupTerminator { grace }
    }
}

#[cfg(unix)]
impl Default for ProcessGroupTerminator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessTreeTerminator for ProcessGroupTerminator {
    async fn terminate_tree(&self, pid: u32) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(pid as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => tracing::debug!(pid, "sent SIGTERM to process group"),
            // Whole group already gone; nothing left to kill.
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }

        tokio::time::sleep(self.grace).await;

        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pid, "sent SIGKILL to process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
        Ok(())
    }
}

/// The platform default, if one exists.
pub(crate) fn default_terminator() -> Option<std::sync::Arc<dyn ProcessTreeTerminator>> {
    #[cfg(unix)]
    {
        Some(std::sync::Arc::new(ProcessGroupTerminator::new()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_default_terminator_exists_on_unix() {
        assert!(default_terminator().is_some());
    }

    #[tokio::test]
    async fn test_terminating_a_dead_group_is_ok() {
        // Spawn and fully reap a child so its pid (and group) is stale.
        let mut child = tokio::process::Command::new("true")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let terminator = ProcessGroupTerminator::with_grace(Duration::from_millis(10));
        terminator.terminate_tree(pid).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_tree_kills_group_leader() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let terminator = ProcessGroupTerminator::with_grace(Duration::from_millis(50));
        terminator.terminate_tree(pid).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should die promptly")
            .unwrap();
        assert!(!status.success());
    }
}
