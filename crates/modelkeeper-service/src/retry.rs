//! Bounded retries with exponential backoff.
use std::future::Future;
use std::time::Duration;

use crate::config::WriterConfig;
use crate::metric;

/// How often and how patiently an operation is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. A value of `0` is treated as `1`.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// The delay to wait after the given (1-based) failed attempt.
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        WriterConfig::default().into()
    }
}

impl From<WriterConfig> for RetryPolicy {
    fn from(config: WriterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

/// Runs the future created by `task_gen` until it succeeds or fails permanently.
///
/// Errors for which `is_retryable` returns `true` are retried until `policy.max_attempts`
/// attempts have been made, sleeping with exponential backoff in between. The last error is
/// returned once the attempts are exhausted. Any other error is returned immediately.
pub async fn execute_with_retry<G, F, T, E, R>(
    operation: &str,
    policy: &RetryPolicy,
    is_retryable: R,
    mut task_gen: G,
) -> Result<T, E>
where
    G: FnMut() -> F,
    F: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::error::Error + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match task_gen().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable(&error) {
            return Err(error);
        }
        if attempt >= max_attempts {
            metric!(counter("retry.exhausted") += 1, "operation" => operation);
            return Err(error);
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            operation,
            attempt,
            "transient failure, retrying in {delay:?}",
        );
        metric!(counter("retry.attempt") += 1, "operation" => operation);
        tokio::time::sleep(delay).await;
    }
}
