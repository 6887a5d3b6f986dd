//! Retry policy with exponential backoff
//!
//! A job attempt is run through [`run_with_retry`], which turns its result into an
//! [`Outcome`]: finished, retry after a countdown, or failed for good. The attempt number
//! comes from the job queue row, never from process memory, so the count survives restarts.
//!
//! Countdown for attempt `n` (0-based) is `base_delay * 2^n`, capped at `max_delay`, with
//! optional jitter in `[delay, 2 * delay]`.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection reset, upstream misses) return `true`.
/// Permanent failures (invalid input, schema problems, corrupt data) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::Transient(_) => true,
            // Upstream misses may be flakiness; still capped like any failure
            Error::ResourceNotFound(_) => true,
            Error::Delivery(_) => true,
            Error::Timeout { .. } => true,
            // A file may reappear once the download sweep runs again
            Error::FileMissing { .. } => true,
            Error::Validation(_) => false,
            Error::Config { .. } => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Serialization(_) => false,
            Error::ShuttingDown => false,
            Error::Other(_) => false,
        }
    }
}

/// Result of one managed attempt
#[derive(Debug)]
pub enum Outcome<T> {
    /// The attempt succeeded
    Done(T),
    /// The attempt failed and should run again after `countdown`
    Retry {
        /// Delay before the next attempt
        countdown: Duration,
        /// Why this attempt failed
        error: Error,
    },
    /// The attempt failed and must not be retried
    Failed(Error),
}

/// Countdown before retrying after the given (0-based) attempt failed
///
/// `max_delay` caps the result after jitter.
pub fn countdown(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let delay = config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay);

    let delay = if config.jitter { add_jitter(delay) } else { delay };
    delay.min(config.max_delay)
}

/// Classify a failed attempt
pub fn decide<T>(config: &RetryConfig, attempt: u32, error: Error) -> Outcome<T> {
    if matches!(error, Error::ShuttingDown) {
        // Not a job failure; the worker releases the job
        return Outcome::Failed(error);
    }
    if !error.is_retryable() {
        tracing::error!(error = %error, attempt, "Job failed with non-retryable error");
        return Outcome::Failed(error);
    }
    if attempt >= config.max_retries {
        tracing::error!(
            error = %error,
            attempts = attempt + 1,
            "Job failed after all retry attempts exhausted"
        );
        return Outcome::Failed(error);
    }

    let countdown = countdown(config, attempt);
    if error.is_resource_miss() {
        tracing::warn!(
            miss = %error,
            attempt,
            max_retries = config.max_retries,
            countdown_secs = countdown.as_secs(),
            "Upstream resource missing, retrying"
        );
    } else {
        tracing::warn!(
            error = %error,
            attempt,
            max_retries = config.max_retries,
            countdown_secs = countdown.as_secs(),
            "Job failed, retrying"
        );
    }
    Outcome::Retry { countdown, error }
}

/// Run one attempt of an async unit of work under the retry policy
///
/// `attempt` is the number of attempts already consumed, as recorded by the job queue.
pub async fn run_with_retry<F, Fut, T>(config: &RetryConfig, attempt: u32, operation: F) -> Outcome<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Ok(value) => {
            if attempt > 0 {
                tracing::info!(attempts = attempt + 1, "Job succeeded after retry");
            }
            Outcome::Done(value)
        }
        Err(e) => decide(config, attempt, e),
    }
}

/// Run one attempt of blocking work on the blocking thread pool, then apply the same policy
pub async fn run_blocking_with_retry<F, T>(config: &RetryConfig, attempt: u32, operation: F) -> Outcome<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    run_with_retry(config, attempt, || async move {
        tokio::task::spawn_blocking(operation)
            .await
            .map_err(|e| Error::Other(format!("blocking job panicked: {}", e)))?
    })
    .await
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
