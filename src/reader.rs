//! Background worker that drains a child's stdout and stderr into the
//! output queue.
//!
//! One reader task owns both pipe ends. Lines are lossy-decoded (invalid
//! UTF-8 is substituted, never fatal), stripped of trailing whitespace,
//! transformed by the formatter, and forwarded in arrival order. On stream
//! exhaustion, shutdown, or a read error the reader closes the queue (the
//! end marker) and fires the reader-end notification exactly once, so no
//! consumer blocks forever.

use crate::formatter::OutputFormatter;
use crate::queue::OutputQueue;
use crate::state::Shutdown;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub(crate) struct OutputReader<O, E> {
    pub(crate) stdout: BufReader<O>,
    pub(crate) stderr: BufReader<E>,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) formatter: Arc<dyn OutputFormatter>,
    pub(crate) queue: Arc<OutputQueue>,
    /// Invoked for every line read, before the empty-line filter; feeds the
    /// stale-output timer.
    pub(crate) on_activity: Box<dyn Fn() + Send + Sync>,
    /// Invoked with each transformed, non-empty line; feeds the durable
    /// accumulation.
    pub(crate) on_line: Box<dyn Fn(&str) + Send + Sync>,
    /// Invoked exactly once when the reader finishes.
    pub(crate) on_end: Box<dyn FnOnce() + Send>,
}

impl<O, E> OutputReader<O, E>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    pub(crate) async fn run(self) {
        let OutputReader {
            mut stdout,
            mut stderr,
            shutdown,
            formatter,
            queue,
            on_activity,
            on_line,
            on_end,
        } = self;

        if catch_unwind(AssertUnwindSafe(|| formatter.begin())).is_err() {
            tracing::warn!("output formatter begin() panicked");
        }

        let emit = |buf: &mut Vec<u8>| {
            let line = String::from_utf8_lossy(buf).trim_end().to_string();
            buf.clear();
            on_activity();
            if line.is_empty() {
                return;
            }
            let transformed = match catch_unwind(AssertUnwindSafe(|| formatter.transform(&line))) {
                Ok(transformed) => transformed,
                Err(_) => {
                    tracing::warn!("output formatter transform panicked; using raw line");
                    line
                }
            };
            on_line(&transformed);
            queue.push(transformed);
        };

        let mut out_buf: Vec<u8> = Vec::new();
        let mut err_buf: Vec<u8> = Vec::new();
        let mut out_done = false;
        let mut err_done = false;

        // read_until is cancellation safe: a partially read line stays in
        // its buffer and the next call keeps appending to it.
        while !(out_done && err_done) {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::trace!("output reader interrupted by shutdown");
                    break;
                }
                read = stdout.read_until(b'\n', &mut out_buf), if !out_done => {
                    match read {
                        Ok(0) => out_done = true,
                        Ok(_) => emit(&mut out_buf),
                        Err(e) => {
                            tracing::debug!(error = %e, "stdout read error");
                            out_done = true;
                        }
                    }
                }
                read = stderr.read_until(b'\n', &mut err_buf), if !err_done => {
                    match read {
                        Ok(0) => err_done = true,
                        Ok(_) => emit(&mut err_buf),
                        Err(e) => {
                            tracing::debug!(error = %e, "stderr read error");
                            err_done = true;
                        }
                    }
                }
            }
        }

        queue.close();
        on_end();
        if catch_unwind(AssertUnwindSafe(|| formatter.end())).is_err() {
            tracing::warn!("output formatter end() panicked");
        }
    }
}
