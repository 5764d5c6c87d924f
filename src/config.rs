//! Supervisor construction configuration.
//!
//! Validation happens before any process exists: a shell-string command with
//! shell mode explicitly disabled, or shell metacharacters inside an argv
//! command with shell mode explicitly disabled, are configuration errors. An
//! argv command containing metacharacters with shell mode left unset is
//! auto-promoted to shell invocation.

use crate::error::SupervisorError;
use crate::formatter::{NullOutputFormatter, OutputFormatter};
use crate::registry::SupervisorRegistry;
use crate::supervisor::ProcessInfo;
use crate::terminator::ProcessTreeTerminator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Tokens that only a shell can interpret.
const SHELL_METACHARS: [&str; 8] = ["&&", "||", "|", ";", ">", "<", "2>", "&"];

pub type TimeoutCallback = Box<dyn Fn(ProcessInfo) + Send + Sync>;
pub type CompleteCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
enum CommandSpec {
    /// Argument vector, executed directly.
    Argv(Vec<String>),
    /// A single shell line, executed via `sh -c`.
    Line(String),
}

/// How the command is actually handed to the OS after validation.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedCommand {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    /// Human-readable rendition for logs, errors and `ProcessInfo`.
    pub(crate) display: String,
}

/// Builder-style configuration for a [`crate::ProcessSupervisor`].
pub struct SupervisorConfig {
    command: CommandSpec,
    shell_mode: Option<bool>,
    pub(crate) current_dir: Option<PathBuf>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) stale_timeout: Option<Duration>,
    pub(crate) check: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) on_timeout: Option<TimeoutCallback>,
    pub(crate) on_complete: Option<CompleteCallback>,
    pub(crate) formatter: Arc<dyn OutputFormatter>,
    pub(crate) terminator: Option<Arc<dyn ProcessTreeTerminator>>,
    pub(crate) registry: Option<Arc<SupervisorRegistry>>,
}

impl SupervisorConfig {
    /// Configure an argv command.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_command(CommandSpec::Argv(
            command.into_iter().map(Into::into).collect(),
        ))
    }

    /// Configure a shell-string command (runs under `sh -c`).
    pub fn shell(line: impl Into<String>) -> Self {
        Self::with_command(CommandSpec::Line(line.into()))
    }

    fn with_command(command: CommandSpec) -> Self {
        SupervisorConfig {
            command,
            shell_mode: None,
            current_dir: None,
            env: Vec::new(),
            timeout: None,
            stale_timeout: None,
            check: false,
            poll_interval: Duration::from_millis(100),
            on_timeout: None,
            on_complete: None,
            formatter: Arc::new(NullOutputFormatter),
            terminator: crate::terminator::default_terminator(),
            registry: None,
        }
    }

    /// Explicitly enable or disable shell invocation. Unset = auto-detect.
    pub fn shell_mode(mut self, shell: bool) -> Self {
        self.shell_mode = Some(shell);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Global timeout, measured from process start.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stale-output timeout, reset on every received line.
    pub fn stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }

    /// Make `wait()` report a nonzero exit code as an error.
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Watchdog polling interval; bounds timeout-detection latency.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Callback invoked (at most once) when a timeout commits, before the
    /// process tree is terminated.
    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProcessInfo) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    /// Callback invoked (at most once) when the process completes naturally.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn formatter(mut self, formatter: impl OutputFormatter + 'static) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    /// Replace the process-tree termination capability.
    pub fn terminator(mut self, terminator: Arc<dyn ProcessTreeTerminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Remove the tree-termination capability. Kills then reach the root
    /// process only and descendants may be orphaned; the supervisor logs
    /// this degradation when it terminates.
    pub fn no_tree_termination(mut self) -> Self {
        self.terminator = None;
        self
    }

    /// Register with a specific registry instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<SupervisorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resolve the command into its executable form, validating the
    /// command/shell combination.
    pub(crate) fn resolve(&self) -> Result<ResolvedCommand, SupervisorError> {
        if self.poll_interval.is_zero() {
            return Err(SupervisorError::config("poll_interval must be nonzero"));
        }
        match &self.command {
            CommandSpec::Line(line) => {
                if self.shell_mode == Some(false) {
                    return Err(SupervisorError::config(
                        "string commands require shell mode; \
                         enable shell mode or provide an argument vector",
                    ));
                }
                Ok(shell_command(line.clone()))
            }
            CommandSpec::Argv(argv) => {
                if argv.is_empty() || argv[0].is_empty() {
                    return Err(SupervisorError::config("command must not be empty"));
                }
                let meta: Vec<&str> = argv
                    .iter()
                    .map(String::as_str)
                    .filter(|arg| SHELL_METACHARS.contains(arg))
                    .collect();
                let use_shell = match self.shell_mode {
                    Some(true) => true,
                    Some(false) => {
                        if !meta.is_empty() {
                            return Err(SupervisorError::config(format!(
                                "shell metacharacters {meta:?} found in command \
                                 but shell mode is disabled"
                            )));
                        }
                        false
                    }
                    None => !meta.is_empty(),
                };
                if use_shell {
                    Ok(shell_command(shell_join(argv)))
                } else {
                    Ok(ResolvedCommand {
                        program: argv[0].clone(),
                        args: argv[1..].to_vec(),
                        display: shell_join(argv),
                    })
                }
            }
        }
    }

    /// Human-readable command rendition, independent of validation.
    pub fn command_line(&self) -> String {
        match &self.command {
            CommandSpec::Argv(argv) => shell_join(argv),
            CommandSpec::Line(line) => line.clone(),
        }
    }
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("command", &self.command)
            .field("shell_mode", &self.shell_mode)
            .field("current_dir", &self.current_dir)
            .field("timeout", &self.timeout)
            .field("stale_timeout", &self.stale_timeout)
            .field("check", &self.check)
            .field("poll_interval", &self.poll_interval)
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

fn shell_command(line: String) -> ResolvedCommand {
    ResolvedCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), line.clone()],
        display: line,
    }
}

/// Join an argument vector into a single shell line with POSIX quoting.
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> SupervisorConfig {
        SupervisorConfig::new(parts.iter().copied())
    }

    #[test]
    fn test_plain_argv_resolves_directly() {
        let resolved = argv(&["echo", "hello"]).resolve().unwrap();
        assert_eq!(resolved.program, "echo");
        assert_eq!(resolved.args, vec!["hello"]);
        assert_eq!(resolved.display, "echo hello");
    }

    #[test]
    fn test_shell_string_defaults_to_shell_invocation() {
        let resolved = SupervisorConfig::shell("echo hi | grep h")
            .resolve()
            .unwrap();
        assert_eq!(resolved.program, "sh");
        assert_eq!(resolved.args[0], "-c");
        assert_eq!(resolved.args[1], "echo hi | grep h");
    }

    #[test]
    fn test_shell_string_with_shell_disabled_is_config_error() {
        let err = SupervisorConfig::shell("echo hi")
            .shell_mode(false)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Config { .. }));
        assert!(err.to_string().contains("require shell mode"));
    }

    #[test]
    fn test_argv_with_metachars_auto_promotes_to_shell() {
        let resolved = argv(&["echo", "a", "|", "grep", "a"]).resolve().unwrap();
        assert_eq!(resolved.program, "sh");
        assert!(resolved.args[1].contains('|'));
    }

    #[test]
    fn test_argv_with_metachars_and_shell_disabled_is_config_error() {
        let err = argv(&["echo", "a", "&&", "echo", "b"])
            .shell_mode(false)
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("&&"));
    }

    #[test]
    fn test_empty_command_is_config_error() {
        let err = SupervisorConfig::new(Vec::<String>::new())
            .resolve()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Config { .. }));
    }

    #[test]
    fn test_zero_poll_interval_is_config_error() {
        let err = argv(&["true"])
            .poll_interval(Duration::ZERO)
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn test_explicit_shell_mode_joins_argv() {
        let resolved = argv(&["echo", "hello world"])
            .shell_mode(true)
            .resolve()
            .unwrap();
        assert_eq!(resolved.program, "sh");
        assert_eq!(resolved.args[1], "echo 'hello world'");
    }

    #[test]
    fn test_shell_join_quotes_specials() {
        let args: Vec<String> = vec!["echo".into(), "hello world".into(), "it's".into()];
        assert_eq!(shell_join(&args), r"echo 'hello world' 'it'\''s'");
    }

    #[test]
    fn test_shell_join_leaves_safe_args_bare() {
        let args: Vec<String> = vec!["ls".into(), "-la".into(), "./src".into()];
        assert_eq!(shell_join(&args), "ls -la ./src");
    }

    #[test]
    fn test_builder_defaults() {
        let config = argv(&["true"]);
        assert!(!config.check);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.timeout.is_none());
        assert!(config.stale_timeout.is_none());
        assert!(config.registry.is_none());
    }

    #[test]
    fn test_debug_does_not_require_debug_callbacks() {
        let config = argv(&["true"]).on_complete(|| {});
        let rendered = format!("{config:?}");
        assert!(rendered.contains("on_complete: true"));
    }
}
