//! Pluggable line transformation applied by the output reader.

use crate::state::lock;
use std::sync::Mutex;
use std::time::Instant;

/// Transforms output lines as they are read from the process.
///
/// `begin()` and `end()` bracket the reader's loop exactly once each,
/// regardless of how many consumers iterate the output. Panics from any of
/// the three methods are caught at the reader boundary and logged; a
/// panicking `transform` leaves the line unmodified.
pub trait OutputFormatter: Send + Sync {
    /// Called once before the first line is read.
    fn begin(&self) {}

    /// Transform a single line.
    fn transform(&self, line: &str) -> String;

    /// Called once after the stream ends.
    fn end(&self) {}
}

/// Identity formatter; the default.
#[derive(Debug, Default)]
pub struct NullOutputFormatter;

impl OutputFormatter for NullOutputFormatter {
    fn transform(&self, line: &str) -> String {
        line.to_string()
    }
}

/// Prefixes each line with seconds elapsed since `begin()`, e.g.
/// `[1.23] test output`.
#[derive(Debug, Default)]
pub struct TimeDeltaFormatter {
    started: Mutex<Option<Instant>>,
}

impl TimeDeltaFormatter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputFormatter for TimeDeltaFormatter {
    fn begin(&self) {
        *lock(&self.started) = Some(Instant::now());
    }

    fn transform(&self, line: &str) -> String {
        let elapsed = lock(&self.started)
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        format!("[{elapsed:.2}] {line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_formatter_is_identity() {
        let formatter = NullOutputFormatter;
        formatter.begin();
        assert_eq!(formatter.transform("hello"), "hello");
        formatter.end();
    }

    #[test]
    fn test_time_delta_prefixes_elapsed_seconds() {
        let formatter = TimeDeltaFormatter::new();
        formatter.begin();
        let line = formatter.transform("build ok");
        assert!(line.starts_with('['));
        assert!(line.ends_with("] build ok"));
    }

    #[test]
    fn test_time_delta_without_begin_uses_zero() {
        let formatter = TimeDeltaFormatter::new();
        assert_eq!(formatter.transform("x"), "[0.00] x");
    }
}
