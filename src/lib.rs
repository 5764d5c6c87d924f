//! Supervised subprocess execution with streaming output, watchdog timeouts,
//! and process-tree cleanup.
//!
//! A [`ProcessSupervisor`] spawns a command in its own process group, drains
//! its combined stdout/stderr through a background reader task, enforces
//! global and stale-output deadlines from a background watchdog task, and
//! guarantees the process (and, where possible, its descendants) is
//! terminated exactly once, whichever of natural exit, timeout, or explicit
//! kill happens first. Output arrives in order through a queue that never
//! blocks the producer, ending with a sticky end-of-stream marker every
//! consumer can observe.
//!
//! ```rust,no_run
//! use foreman::{ProcessSupervisor, SupervisorConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), foreman::SupervisorError> {
//! let config = SupervisorConfig::new(["make", "build"])
//!     .timeout(Duration::from_secs(300))
//!     .on_timeout(|info| eprintln!("pid {} timed out after {:?}", info.pid, info.duration));
//! let process = ProcessSupervisor::spawn(config)?;
//!
//! let mut lines = process.line_iter(Some(Duration::from_secs(5)));
//! while let Some(line) = lines.next().await? {
//!     println!("{line}");
//! }
//! let exit_code = process.wait(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod formatter;
mod queue;
mod reader;
pub mod registry;
mod state;
pub mod supervisor;
pub mod terminator;
mod watchdog;

pub use config::SupervisorConfig;
pub use error::SupervisorError;
pub use formatter::{NullOutputFormatter, OutputFormatter, TimeDeltaFormatter};
pub use queue::LinePoll;
pub use registry::{ActiveProcess, SupervisorRegistry};
pub use state::ProcessState;
pub use supervisor::{CompletedCommand, LineIter, ProcessInfo, ProcessSupervisor};
#[cfg(unix)]
pub use terminator::ProcessGroupTerminator;
pub use terminator::ProcessTreeTerminator;
