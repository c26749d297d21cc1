//! Trait for reporting build-facing library diagnostics.

use std::sync::Mutex;

/// Receives the console lines a build shows its user.
///
/// This lets the core emit the exact diagnostics downstream tooling matches on
/// without writing to stdout/stderr itself.
pub trait BuildReporter: Send + Sync {
    fn line(&self, message: &str);
}

/// Forwards every line to `tracing` at INFO level.
pub struct TracingReporter;

impl BuildReporter for TracingReporter {
    fn line(&self, message: &str) {
        tracing::info!(target: "pipelib::build", "{}", message);
    }
}

/// Keeps every line in memory, in order.
#[derive(Default)]
pub struct RecordingReporter {
    lines: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

impl BuildReporter for RecordingReporter {
    fn line(&self, message: &str) {
        tracing::debug!(target: "pipelib::build", "{}", message);
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}
