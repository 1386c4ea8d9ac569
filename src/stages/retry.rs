//! Per-item retry with increasing delay.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::StageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Two means at most three attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// How a retried operation ended.
#[derive(Debug, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, retries: u32 },
    /// Last error, after the retry budget ran out or a non-retryable error.
    Failed { error: StageError, retries: u32 },
    /// Cancellation was observed before a retry could start.
    Cancelled { last_error: StageError, retries: u32 },
}

/// Run `op` until it succeeds, fails with a non-retryable error, or has
/// been retried `policy.max_retries` times.
///
/// Cancellation is checked before each retry and interrupts the backoff
/// sleep; an attempt already running is never interrupted.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut retries = 0;
    loop {
        let error = match op().await {
            Ok(value) => return RetryOutcome::Succeeded { value, retries },
            Err(error) => error,
        };
        if !error.is_retryable() || retries >= policy.max_retries {
            return RetryOutcome::Failed { error, retries };
        }

        let delay = policy.delay_for(retries);
        tracing::debug!(
            retry = retries + 1,
            max_retries = policy.max_retries,
            ?delay,
            %error,
            "retrying after error"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return RetryOutcome::Cancelled { last_error: error, retries };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled {
                last_error: error,
                retries,
            };
        }
        retries += 1;
    }
}
