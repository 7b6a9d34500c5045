use crate::llm::GatewayError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Errors that can tell whether another attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        GatewayError::is_retryable(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Wait before the retry that follows failed attempt `attempt`
    /// (zero-based). Grows linearly with the attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt + 1)
    }
}

/// Result of [`run_with_retry`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Number of times the operation ran.
    pub attempts: u32,
    /// Duration of the last attempt only; earlier attempts and backoff
    /// waits are not included.
    pub latency: Duration,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// or has failed retryably `policy.max_retries + 1` times.
///
/// Never panics on failure: the final error is handed back in the outcome.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;
    loop {
        let started = Instant::now();
        let result = operation(attempt).await;
        let latency = started.elapsed();

        match result {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                time::sleep(delay).await;
                attempt += 1;
            }
            result => {
                if let Err(e) = &result {
                    debug!(attempt, error = %e, "Giving up");
                }
                return RetryOutcome {
                    result,
                    attempts: attempt + 1,
                    latency,
                };
            }
        }
    }
}
