//! The supervisor: process identity, the state machine, and the public API.
//!
//! Three actors converge here: the caller, the output reader, and the
//! watchdog. Whichever of natural exit, timeout, or explicit kill reaches
//! the guarded state transition first decides the terminal state; the losers
//! degrade to no-ops. Physical termination is separately guaranteed to
//! happen at most once.

use crate::config::{CompleteCallback, ResolvedCommand, SupervisorConfig, TimeoutCallback};
use crate::error::SupervisorError;
use crate::formatter::OutputFormatter;
use crate::queue::{LinePoll, OutputQueue};
use crate::reader::OutputReader;
use crate::registry::SupervisorRegistry;
use crate::state::{lock, ProcessState, Shutdown, StateCell};
use crate::terminator::ProcessTreeTerminator;
use crate::watchdog::Watchdog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::process::{Child, Command};

/// Sleep between completion checks in `wait()`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long `wait()` lets the reader flush the output tail after exit.
const READER_FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Snapshot handed to the `on_timeout` callback at the instant a timeout
/// is detected.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub duration: Duration,
}

/// Result of the one-shot [`ProcessSupervisor::run`] convenience.
#[derive(Debug, Clone)]
pub struct CompletedCommand {
    pub exit_code: i32,
    /// Combined stdout/stderr, newline-joined.
    pub output: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl Stamp {
    fn now() -> Self {
        Stamp {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// State shared by the caller, the output reader and the watchdog.
pub(crate) struct Shared {
    pub(crate) command_line: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) stale_timeout: Option<Duration>,
    pub(crate) poll_interval: Duration,
    pub(crate) state: StateCell,
    pub(crate) queue: Arc<OutputQueue>,
    pub(crate) shutdown: Arc<Shutdown>,
    /// Every line ever produced, in order. Only the reader appends.
    accumulated: Mutex<Vec<String>>,
    last_line: Mutex<Option<Instant>>,
    started: Mutex<Option<Stamp>>,
    ended: Mutex<Option<Stamp>>,
    pid: AtomicU32,
    child: Mutex<Option<Child>>,
    exit_code: OnceLock<i32>,
    /// Physical termination happens at most once, whoever requests it.
    kill_requested: AtomicBool,
    termination_notified: AtomicBool,
    on_timeout: Option<TimeoutCallback>,
    on_complete: Option<CompleteCallback>,
    formatter: Arc<dyn OutputFormatter>,
    terminator: Option<Arc<dyn ProcessTreeTerminator>>,
    registry: Arc<SupervisorRegistry>,
}

impl Shared {
    pub(crate) fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub(crate) fn started_instant(&self) -> Option<Instant> {
        lock(&self.started).map(|s| s.instant)
    }

    pub(crate) fn started_wall(&self) -> Option<DateTime<Utc>> {
        lock(&self.started).map(|s| s.wall)
    }

    pub(crate) fn ended_wall(&self) -> Option<DateTime<Utc>> {
        lock(&self.ended).map(|s| s.wall)
    }

    pub(crate) fn last_line_instant(&self) -> Option<Instant> {
        *lock(&self.last_line)
    }

    /// Time since spawn, while running; total runtime once ended.
    pub(crate) fn running_for(&self) -> Option<Duration> {
        let started = self.started_instant()?;
        match *lock(&self.ended) {
            Some(ended) => Some(ended.instant.duration_since(started)),
            None => Some(started.elapsed()),
        }
    }

    /// Time since the last output line (or since start, before any line).
    pub(crate) fn idle_for(&self) -> Option<Duration> {
        let last = self.last_line_instant().or_else(|| self.started_instant())?;
        Some(last.elapsed())
    }

    pub(crate) fn process_info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid(),
            command: self.command_line.clone(),
            duration: self.running_for().unwrap_or_default(),
        }
    }

    fn touch_activity(&self) {
        *lock(&self.last_line) = Some(Instant::now());
    }

    fn accumulate(&self, line: &str) {
        lock(&self.accumulated).push(line.to_string());
    }

    pub(crate) fn output_lines(&self) -> Vec<String> {
        lock(&self.accumulated).clone()
    }

    fn record_ended(&self) {
        let mut ended = lock(&self.ended);
        if ended.is_none() {
            *ended = Some(Stamp::now());
        }
    }

    /// Idempotent end-of-life bookkeeping shared by every termination path
    /// (reader end, poll, wait, kill, watchdog).
    fn notify_terminated(&self) {
        if self.termination_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record_ended();
        self.registry.unregister(self);
    }

    fn reader_finished(&self) {
        self.notify_terminated();
    }

    /// Non-blocking exit check. Commits `Completed` (idempotently) and
    /// caches the exit code when the OS reports the process gone.
    pub(crate) fn try_reap(&self) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }
        let status = {
            let mut guard = lock(&self.child);
            let child = guard.as_mut()?;
            match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(pid = self.pid(), error = %e, "failed to poll process");
                    return None;
                }
            }
        };
        Some(self.observe_exit(status))
    }

    fn observe_exit(&self, status: ExitStatus) -> i32 {
        let code = exit_code_of(status);
        let _ = self.exit_code.set(code);
        if self.state.try_commit(ProcessState::Completed(code)) {
            tracing::info!(pid = self.pid(), code, "process completed");
            self.fire_on_complete();
        }
        self.notify_terminated();
        code
    }

    pub(crate) fn fire_on_timeout(&self, info: ProcessInfo) {
        if let Some(callback) = &self.on_timeout {
            if catch_unwind(AssertUnwindSafe(|| callback(info))).is_err() {
                tracing::warn!("timeout callback panicked");
            }
        }
    }

    fn fire_on_complete(&self) {
        if let Some(callback) = &self.on_complete {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::warn!("completion callback panicked");
            }
        }
    }

    /// Physically terminate the process tree, at most once across all
    /// callers, then reap. Errors are logged, never propagated.
    pub(crate) async fn ensure_terminated(&self) {
        if self.kill_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.signal();
        let pid = self.pid();
        if pid == 0 {
            return;
        }
        match &self.terminator {
            Some(terminator) => {
                if let Err(e) = terminator.terminate_tree(pid).await {
                    tracing::warn!(
                        pid,
                        error = %e,
                        "process tree termination failed; killing root only"
                    );
                    self.kill_root();
                }
            }
            None => {
                tracing::warn!(
                    pid,
                    "no process tree terminator available; killing root process \
                     only, descendants may be orphaned"
                );
                self.kill_root();
            }
        }
        for _ in 0..100 {
            if self.try_reap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tracing::warn!(pid, "process not reaped after kill");
    }

    pub(crate) fn kill_root(&self) {
        let mut guard = lock(&self.child);
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "root kill failed (process likely already exited)");
            }
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Supervises a single spawned process: streams its combined output without
/// blocking, enforces timeouts from a background watchdog, and guarantees
/// termination exactly once. See the crate docs for an end-to-end example.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    resolved: ResolvedCommand,
    current_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    check: bool,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("command_line", &self.shared.command_line)
            .field("current_dir", &self.current_dir)
            .field("env", &self.env)
            .field("check", &self.check)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Validate the configuration without spawning anything. Pair with
    /// [`start`](Self::start) for deferred launch.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let resolved = config.resolve()?;
        let registry = config
            .registry
            .unwrap_or_else(|| Arc::clone(SupervisorRegistry::global()));
        let shared = Arc::new(Shared {
            command_line: resolved.display.clone(),
            timeout: config.timeout,
            stale_timeout: config.stale_timeout,
            poll_interval: config.poll_interval,
            state: StateCell::new(),
            queue: Arc::new(OutputQueue::new()),
            shutdown: Arc::new(Shutdown::new()),
            accumulated: Mutex::new(Vec::new()),
            last_line: Mutex::new(None),
            started: Mutex::new(None),
            ended: Mutex::new(None),
            pid: AtomicU32::new(0),
            child: Mutex::new(None),
            exit_code: OnceLock::new(),
            kill_requested: AtomicBool::new(false),
            termination_notified: AtomicBool::new(false),
            on_timeout: config.on_timeout,
            on_complete: config.on_complete,
            formatter: config.formatter,
            terminator: config.terminator,
            registry,
        });
        Ok(ProcessSupervisor {
            shared,
            resolved,
            current_dir: config.current_dir,
            env: config.env,
            check: config.check,
        })
    }

    /// Validate, spawn and start supervising in one step.
    pub fn spawn(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let mut supervisor = Self::new(config)?;
        supervisor.start()?;
        Ok(supervisor)
    }

    /// Spawn the process and start both workers. Must be called within a
    /// Tokio runtime. Spawn failures surface here and no workers start.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        match self.shared.state.get() {
            ProcessState::Created => {}
            other => {
                return Err(SupervisorError::config(format!(
                    "process already started (state: {other})"
                )));
            }
        }

        let mut command = Command::new(&self.resolved.program);
        command
            .args(&self.resolved.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        // New process group so a tree kill reaches every descendant.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared
                    .state
                    .try_commit(ProcessState::Failed(e.to_string()));
                return Err(SupervisorError::Spawn {
                    command: self.resolved.display.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            self.shared
                .state
                .try_commit(ProcessState::Failed("output pipes unavailable".to_string()));
            return Err(SupervisorError::config("output pipes unavailable"));
        };

        self.shared.pid.store(pid, Ordering::SeqCst);
        *lock(&self.shared.started) = Some(Stamp::now());
        *lock(&self.shared.child) = Some(child);
        self.shared.state.try_commit(ProcessState::Running);
        self.shared.registry.register(Arc::clone(&self.shared));
        tracing::info!(pid, command = %self.resolved.display, "process started");

        let reader = OutputReader {
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
            shutdown: Arc::clone(&self.shared.shutdown),
            formatter: Arc::clone(&self.shared.formatter),
            queue: Arc::clone(&self.shared.queue),
            on_activity: {
                let shared = Arc::clone(&self.shared);
                Box::new(move || shared.touch_activity())
            },
            on_line: {
                let shared = Arc::clone(&self.shared);
                Box::new(move |line: &str| shared.accumulate(line))
            },
            on_end: {
                let shared = Arc::clone(&self.shared);
                Box::new(move || shared.reader_finished())
            },
        };
        tokio::spawn(reader.run());
        tokio::spawn(Watchdog::new(Arc::clone(&self.shared)).run());
        Ok(())
    }

    /// One-shot convenience: spawn, wait to completion, collect output.
    /// A process-level timeout breach is reported as `OperationTimeout`.
    pub async fn run(config: SupervisorConfig) -> Result<CompletedCommand, SupervisorError> {
        let timeout = config.timeout;
        let supervisor = Self::spawn(config)?;
        let waited = supervisor.wait(None).await;
        if supervisor.state() == ProcessState::TimedOut {
            return Err(SupervisorError::OperationTimeout {
                waited: timeout.unwrap_or_default(),
            });
        }
        let exit_code = waited?;
        Ok(CompletedCommand {
            exit_code,
            output: supervisor.output(),
            duration: supervisor.duration().unwrap_or_default(),
        })
    }

    fn ensure_started(&self) -> Result<(), SupervisorError> {
        match self.shared.state.get() {
            ProcessState::Created => Err(SupervisorError::config("process has not been started")),
            ProcessState::Failed(msg) => Err(SupervisorError::config(format!(
                "process failed to start: {msg}"
            ))),
            _ => Ok(()),
        }
    }

    /// Non-blocking exit check; returns the exit code once the process is
    /// gone. Idempotent: a second caller observing the same exit is a no-op.
    pub fn poll(&self) -> Option<i32> {
        self.shared.try_reap()
    }

    /// Suspend until the process reaches a terminal state and its exit
    /// status is reaped, or until `timeout` elapses (`OperationTimeout`,
    /// which leaves the process running; the process-level timeout is the
    /// watchdog's job).
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<i32, SupervisorError> {
        self.ensure_started()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let code = loop {
            if let Some(code) = self.poll() {
                break code;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SupervisorError::OperationTimeout {
                        waited: timeout.unwrap_or_default(),
                    });
                }
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        };
        self.flush_tail(deadline).await;
        self.checked(code)
    }

    /// Like [`wait`](Self::wait), draining queued lines to `sink` while
    /// waiting and once more after completion.
    pub async fn wait_echoing<F>(
        &self,
        timeout: Option<Duration>,
        mut sink: F,
    ) -> Result<i32, SupervisorError>
    where
        F: FnMut(&str),
    {
        self.ensure_started()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let code = loop {
            for line in self.drain_stdout() {
                sink(&line);
            }
            if let Some(code) = self.poll() {
                break code;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SupervisorError::OperationTimeout {
                        waited: timeout.unwrap_or_default(),
                    });
                }
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        };
        self.flush_tail(deadline).await;
        for line in self.drain_stdout() {
            sink(&line);
        }
        self.checked(code)
    }

    /// Give the reader a bounded window to finish draining the pipes after
    /// exit, so post-wait consumers see the complete output.
    async fn flush_tail(&self, deadline: Option<Instant>) {
        let grace = Instant::now() + READER_FLUSH_GRACE;
        let cutoff = match deadline {
            Some(deadline) => deadline.min(grace),
            None => grace,
        };
        while !self.shared.queue.is_closed() && Instant::now() < cutoff {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    fn checked(&self, code: i32) -> Result<i32, SupervisorError> {
        if self.check && code != 0 {
            return Err(SupervisorError::NonZeroExit {
                command: self.shared.command_line.clone(),
                code,
            });
        }
        Ok(code)
    }

    /// Pull one output line, suspending up to `timeout`. `Ok(None)` is the
    /// (sticky) end marker; an elapsed timeout on an unfinished stream is
    /// `OperationTimeout`.
    pub async fn next_line(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, SupervisorError> {
        self.ensure_started()?;
        self.shared.queue.pop(timeout).await
    }

    /// Non-blocking variant of [`next_line`](Self::next_line).
    pub fn try_next_line(&self) -> LinePoll {
        self.shared.queue.try_pop()
    }

    /// Atomically empty everything currently queued. Non-blocking; does not
    /// consume the end marker.
    pub fn drain_stdout(&self) -> Vec<String> {
        self.shared.queue.drain()
    }

    /// Lazy, non-restartable sequence of output lines. Stops permanently at
    /// the end marker; `timeout` bounds each `next()` call.
    pub fn line_iter(&self, timeout: Option<Duration>) -> LineIter<'_> {
        LineIter {
            supervisor: self,
            timeout,
            done: false,
        }
    }

    /// Request termination of the whole process tree. Idempotent and
    /// infallible: an already-terminal state keeps its value, the physical
    /// kill happens at most once, and errors are logged, not raised.
    pub async fn kill(&self) {
        if self.shared.pid() == 0 {
            return;
        }
        if self.shared.state.try_commit(ProcessState::Killed) {
            tracing::info!(pid = self.shared.pid(), "kill requested");
        }
        self.shared.ensure_terminated().await;
    }

    /// Polite termination: SIGTERM to the root process only, no escalation.
    /// Same idempotent state semantics as [`kill`](Self::kill).
    pub fn terminate(&self) {
        let pid = self.shared.pid();
        if pid == 0 {
            return;
        }
        if self.shared.state.try_commit(ProcessState::Killed) {
            tracing::info!(pid, "polite termination requested");
        }
        self.shared.shutdown.signal();
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed (process likely already exited)");
            }
        }
        #[cfg(not(unix))]
        self.shared.kill_root();
    }

    // --- Observable surface ---

    pub fn state(&self) -> ProcessState {
        self.shared.state.get()
    }

    pub fn running(&self) -> bool {
        self.poll().is_none() && matches!(self.shared.state.get(), ProcessState::Running)
    }

    pub fn finished(&self) -> bool {
        self.poll().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        let pid = self.shared.pid();
        (pid != 0).then_some(pid)
    }

    /// Exit code, if the exit has been observed (by `poll`, `wait`, or the
    /// watchdog). Negative values are the terminating signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.exit_code()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.started_wall()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.shared.ended_wall()
    }

    /// Wall-clock runtime so far, or total runtime once ended.
    pub fn duration(&self) -> Option<Duration> {
        self.shared.running_for()
    }

    /// Complete accumulated output so far, newline-joined. Available while
    /// the process is still running, independent of queue consumption.
    pub fn output(&self) -> String {
        self.shared.output_lines().join("\n")
    }

    /// Every line produced so far, in arrival order.
    pub fn output_lines(&self) -> Vec<String> {
        self.shared.output_lines()
    }

    pub fn command_line(&self) -> &str {
        &self.shared.command_line
    }

    /// Whether output lines are queued and waiting to be consumed.
    pub fn has_pending_output(&self) -> bool {
        self.shared.queue.has_pending()
    }

    #[cfg(test)]
    pub(crate) fn shared_handle(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

/// Finite, non-restartable sequence of output lines, modeled on
/// [`tokio::io::Lines`].
pub struct LineIter<'a> {
    supervisor: &'a ProcessSupervisor,
    timeout: Option<Duration>,
    done: bool,
}

impl LineIter<'_> {
    /// Next line, or `None` once the end marker has been observed. A
    /// per-line timeout surfaces as `OperationTimeout` without ending the
    /// sequence.
    pub async fn next(&mut self) -> Result<Option<String>, SupervisorError> {
        if self.done {
            return Ok(None);
        }
        match self.supervisor.next_line(self.timeout).await {
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            other => other,
        }
    }
}
