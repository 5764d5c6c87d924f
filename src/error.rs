use std::io;
use std::time::Duration;

/// Errors surfaced by the supervisor's public API.
///
/// Process-level timeouts are never reported through this type: the watchdog
/// handles them asynchronously and they become observable as a terminal
/// state. Cleanup failures (killing, reaping, registry upkeep) are logged and
/// swallowed rather than propagated.
#[derive(Debug)]
pub enum SupervisorError {
    /// Invalid configuration or lifecycle misuse, detected before any
    /// process exists.
    Config { message: String },
    /// The OS failed to create the process.
    Spawn {
        command: String,
        source: io::Error,
    },
    /// A `wait`/`next_line` call's own timeout elapsed. Distinct from the
    /// process-level timeout: the process keeps running.
    OperationTimeout { waited: Duration },
    /// Check mode was enabled and the process exited with a nonzero status.
    NonZeroExit { command: String, code: i32 },
}

impl SupervisorError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        SupervisorError::Config {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Config { message } => {
                write!(f, "invalid supervisor configuration: {message}")
            }
            SupervisorError::Spawn { command, source } => {
                write!(f, "failed to spawn process `{command}`: {source}")
            }
            SupervisorError::OperationTimeout { waited } => {
                write!(f, "operation timed out after {waited:?}")
            }
            SupervisorError::NonZeroExit { command, code } => {
                write!(f, "process `{command}` exited with nonzero status {code}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}
