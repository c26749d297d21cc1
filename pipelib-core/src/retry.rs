//! Bounded retry loop around SCM fetches.

use std::time::Duration;

use crate::context::CancelToken;
use crate::error::{Error, Result};
use crate::report::BuildReporter;

const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Result of one fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Success(T),
    /// May succeed if attempted again.
    Retryable(Error),
    /// Retrying cannot help.
    Fatal(Error),
}

impl<T> FetchOutcome<T> {
    /// Classifies a fetch result.
    ///
    /// Transient SCM failures and I/O errors are retryable; everything else,
    /// including cancellation and configuration errors, is fatal.
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => FetchOutcome::Success(value),
            Err(err @ Error::Scm { transient: true, .. }) => FetchOutcome::Retryable(err),
            Err(err @ Error::Io(_)) => FetchOutcome::Retryable(err),
            Err(err) => FetchOutcome::Fatal(err),
        }
    }
}

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            delay: DEFAULT_DELAY,
        }
    }
}

/// Runs a fetch routine until it succeeds, fails fatally, or retries run out.
pub struct RetryingFetcher<'a> {
    policy: RetryPolicy,
    cancel: &'a CancelToken,
    reporter: &'a dyn BuildReporter,
}

impl<'a> RetryingFetcher<'a> {
    pub fn new(policy: RetryPolicy, cancel: &'a CancelToken, reporter: &'a dyn BuildReporter) -> Self {
        Self {
            policy,
            cancel,
            reporter,
        }
    }

    /// Calls `attempt` up to `retries + 1` times.
    ///
    /// # Errors
    ///
    /// Returns the last failure unchanged once retries are exhausted, a fatal
    /// failure immediately, or [`Error::Cancelled`] if the token fires.
    pub fn fetch_with_retry<T, F>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> FetchOutcome<T>,
    {
        let mut remaining = self.policy.retries;
        loop {
            self.cancel.check()?;
            match attempt() {
                FetchOutcome::Success(value) => return Ok(value),
                FetchOutcome::Fatal(err) => return Err(err),
                FetchOutcome::Retryable(err) => {
                    if remaining == 0 {
                        return Err(err);
                    }
                    remaining -= 1;
                    tracing::warn!(error = %err, remaining, "library fetch failed");
                    self.reporter.line(&err.to_string());
                    self.reporter.line(&format!(
                        "Retrying after {} seconds",
                        self.policy.delay.as_secs()
                    ));
                    self.cancel.sleep(self.policy.delay)?;
                }
            }
        }
    }
}
