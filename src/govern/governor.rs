//! The retry loop wrapping every governed upstream call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

use crate::config::{Category, RetryConfig};
use crate::error::{ErrorKind, UpstreamError};

use super::backoff;
use super::limiter::RateLimiter;

/// One retry decision, emitted before the governor sleeps and tries again.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// Zero-based attempt that just failed.
    pub attempt: u32,
    /// Delay the governor will sleep before the next attempt.
    pub delay: Duration,
    /// The error that triggered the retry.
    pub error: UpstreamError,
}

/// Options for a single governed execution.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    /// Base backoff delay.
    pub base_delay: Duration,
    /// Backoff ceiling before jitter.
    pub max_delay: Duration,
    /// Overall deadline across all attempts and waits. A wait that would
    /// cross the deadline fails the call instead of sleeping.
    pub deadline: Option<Duration>,
    /// Receives a `RetryEvent` before each retry. Side-effect only; never
    /// affects control flow, and a dropped receiver is ignored.
    pub retry_events: Option<mpsc::UnboundedSender<RetryEvent>>,
}

impl ExecuteOptions {
    /// Attach a retry-event channel, returning the consumable stream.
    pub fn with_retry_events(mut self) -> (Self, UnboundedReceiverStream<RetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.retry_events = Some(tx);
        (self, UnboundedReceiverStream::new(rx))
    }

    /// Set an overall deadline for the call.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for ExecuteOptions {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            deadline: None,
            retry_events: None,
        }
    }
}

/// Governs every outbound call: waits for rate capacity, invokes the
/// operation, and retries according to the error's typed discriminant.
///
/// Thread-safe and cheap to share via `Arc`; concurrent executions in
/// different categories never block each other.
pub struct RequestGovernor {
    limiter: Arc<RateLimiter>,
    defaults: RetryConfig,
}

impl RequestGovernor {
    /// Create a governor over the given limiter.
    pub fn new(limiter: Arc<RateLimiter>, defaults: RetryConfig) -> Self {
        Self { limiter, defaults }
    }

    /// The underlying rate limiter, for status surfaces.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execution options seeded from the configured retry defaults.
    pub fn options(&self) -> ExecuteOptions {
        ExecuteOptions::from(&self.defaults)
    }

    /// Execute an operation under this governor's pacing and retry policy.
    ///
    /// The operation is invoked at most `max_retries + 1` times. A
    /// `RateLimited` failure exhausts the category's bucket and retries with
    /// full backoff; a `Transient` failure retries with half the backoff; a
    /// `Fatal` failure propagates immediately. Exhausting all attempts
    /// returns the last error unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        category: Category,
        mut operation: F,
        options: ExecuteOptions,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let deadline = options.deadline.map(|d| Instant::now() + d);
        let mut attempt: u32 = 0;
        loop {
            self.acquire_token(category, deadline, &options).await?;

            trace!(category = %category, attempt = attempt, "invoking governed operation");
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            category = %category,
                            attempt = attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = match error.kind() {
                ErrorKind::Fatal => {
                    debug!(category = %category, error = %error, "fatal error, not retrying");
                    return Err(error);
                }
                ErrorKind::RateLimited => {
                    // The server knows better than our local accounting.
                    self.limiter.exhaust(category);
                    backoff::compute_delay(attempt, options.base_delay, options.max_delay)
                }
                ErrorKind::Transient => {
                    backoff::compute_delay(attempt, options.base_delay / 2, options.max_delay / 2)
                }
            };

            if attempt >= options.max_retries {
                warn!(
                    category = %category,
                    attempts = attempt + 1,
                    error = %error,
                    "retries exhausted"
                );
                return Err(error);
            }

            warn!(
                category = %category,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying governed operation"
            );
            if let Some(events) = &options.retry_events {
                let _ = events.send(RetryEvent {
                    attempt,
                    delay,
                    error: error.clone(),
                });
            }

            self.sleep_within_deadline(delay, deadline, &options).await?;
            attempt += 1;
        }
    }

    /// Suspend until a token has been taken for the category, sleeping the
    /// limiter's suggested wait between attempts. Check-and-take is a single
    /// step under the bucket's lock, so two tasks can never both claim the
    /// last token. Never busy-spins; other categories keep draining while
    /// this one waits.
    async fn acquire_token(
        &self,
        category: Category,
        deadline: Option<Instant>,
        options: &ExecuteOptions,
    ) -> Result<(), UpstreamError> {
        while !self.limiter.consume(category) {
            let wait = self.limiter.wait_time(category);
            trace!(
                category = %category,
                wait_ms = wait.as_millis() as u64,
                "waiting for rate capacity"
            );
            self.sleep_within_deadline(wait, deadline, options).await?;
        }
        Ok(())
    }

    async fn sleep_within_deadline(
        &self,
        wait: Duration,
        deadline: Option<Instant>,
        options: &ExecuteOptions,
    ) -> Result<(), UpstreamError> {
        if let Some(deadline) = deadline {
            if Instant::now() + wait > deadline {
                return Err(UpstreamError::DeadlineExceeded(
                    options.deadline.unwrap_or_default(),
                ));
            }
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }
}
