//! Bounded retry for remote calls.
//!
//! Every call that crosses a process boundary (object storage, primary store,
//! search index, offset persistence) goes through a [`RetryExecutor`]. On final
//! failure the executor hands back the error produced by the last attempt,
//! exactly as the operation returned it.

use std::fmt::Display;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Classifies an error as transient (worth another attempt) or permanent.
pub trait Retryable {
    /// Returns true when the failed call may succeed if attempted again.
    fn is_retryable(&self) -> bool;
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionRefused
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::UnexpectedEof
        )
    }
}

/// Retry bounds and pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub first_delay: Duration,
    /// Added to the delay for every further retry.
    pub step_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Whether to add up to 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_delay: Duration::from_millis(100),
            step_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a fixed first delay and a linear step, no cap and no jitter.
    pub fn new(max_attempts: u32, first_delay: Duration, step_delay: Duration) -> Self {
        Self {
            max_attempts,
            first_delay,
            step_delay,
            max_delay: Duration::MAX,
            jitter: false,
        }
    }

    /// A policy performing exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Cap every delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Effective number of attempts (never below one).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    ///
    /// `first_delay + step_delay * (retry - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let steps = retry.saturating_sub(1);
        self.first_delay
            .saturating_add(self.step_delay.saturating_mul(steps))
            .min(self.max_delay)
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this executor applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying failures the error itself reports as retryable.
    pub async fn exec<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.exec_with(|e: &E| e.is_retryable(), operation).await
    }

    /// Run an operation that produces no value. Same semantics as [`exec`](Self::exec).
    pub async fn execute<F, Fut, E>(&self, operation: F) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Retryable + Display,
    {
        self.exec(operation).await
    }

    /// Run `operation`, retrying a failure only while `should_retry` accepts it.
    ///
    /// Stops after `max_attempts` invocations or as soon as the predicate
    /// refuses an error, and returns that error untouched.
    pub async fn exec_with<F, Fut, T, E, P>(&self, should_retry: P, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= attempts || !should_retry(&e) {
                        debug!(attempt, max_attempts = attempts, error = %e, "giving up");
                        return Err(e);
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "call failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Result-based retry: run `operation` while `should_continue` holds for its result.
    ///
    /// Returns the first result the predicate rejects, or the last result once
    /// attempts are exhausted.
    pub async fn exec_until<F, Fut, T, P>(&self, should_continue: P, mut operation: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
        P: Fn(&T) -> bool,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = operation().await;
            if attempt >= attempts || !should_continue(&result) {
                return result;
            }
            let delay = self.backoff(attempt);
            debug!(attempt, max_attempts = attempts, delay_ms = delay.as_millis() as u64, "result not final, retrying");
            sleep(delay).await;
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let delay = self.policy.delay_for(retry);
        if !self.policy.jitter {
            return delay;
        }
        let half_ms = (delay.as_millis() / 2) as u64;
        if half_ms == 0 {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=half_ms);
        delay
            .saturating_add(Duration::from_millis(jitter_ms))
            .min(self.policy.max_delay)
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
