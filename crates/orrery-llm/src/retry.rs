//! Backoff-with-jitter retry for provider calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use orrery_types::{LlmError, LlmErrorKind};

/// Retry configuration. Attempts are 1-indexed; the delay before attempt
/// `k+1` is `initial × factor^(k−1)` clamped to `max_delay`, multiplied by a
/// uniform jitter in `[0.5, 1.5)` when enabled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Three attempts with a fixed 500 ms delay.
    pub fn linear() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }

    /// Three attempts with slow, steep backoff for long-running operations.
    pub fn patient() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 3.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Five attempts starting at 500 ms for unreliable operations.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Delay before the next attempt, given the 1-indexed attempt that just
    /// failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let mut delay =
            self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let max = self.max_delay.as_secs_f64();
        if delay > max {
            delay = max;
        }
        if self.jitter {
            let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
            delay *= jitter;
        }
        Duration::from_secs_f64(delay)
    }
}

fn cancelled_error() -> LlmError {
    LlmError::new(LlmErrorKind::Unknown, "client", "operation cancelled")
}

/// Execute `f` with retry according to `policy`.
///
/// Retries stop when the error is not retryable or the attempt ceiling is
/// reached. When the error carries `retry_after` within `max_delay`, that
/// value overrides the computed delay. Cancellation is observed between
/// attempts and during the backoff sleep.
pub async fn retry<T, F, Fut>(
    token: &CancellationToken,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        if token.is_cancelled() {
            return Err(cancelled_error());
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= max_attempts {
                    return Err(err);
                }

                let mut delay = policy.delay_for_attempt(attempt);
                if let Some(after) = err.retry_after {
                    if after <= policy.max_delay {
                        delay = after;
                    }
                }
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                last_err = Some(err);

                tokio::select! {
                    _ = token.cancelled() => return Err(cancelled_error()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(cancelled_error))
}
