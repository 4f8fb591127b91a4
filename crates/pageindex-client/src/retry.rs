//! Bounded retry with exponential backoff for remote calls.

use crate::error::{McpError, McpResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Additional attempts after the first failure.
pub const RETRY_COUNT: u32 = 2;

/// Delay before the first retry in milliseconds.
pub const RETRY_MIN_DELAY_MS: u64 = 500;

/// Backoff factor between retries.
pub const RETRY_BACKOFF_FACTOR: f64 = 1.5;

/// Maximum delay between retries in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 3000;

/// Retry policy applied to every remote invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub min_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: RETRY_COUNT,
            min_delay: Duration::from_millis(RETRY_MIN_DELAY_MS),
            factor: RETRY_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Calculate the delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.saturating_sub(1) as i32);
        let delay = self.min_delay.mul_f64(exp);
        delay.min(self.max_delay)
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Run `op` until it succeeds or the retry budget is spent.
    ///
    /// Every failure except [`McpError::AuthRequired`] is retried; a
    /// challenge is returned unwrapped so the caller can re-authorize. Once
    /// the budget is exhausted the last error is wrapped in
    /// [`McpError::RemoteCall`] with the number of attempts.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> McpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth_required() => return Err(e),
                Err(e) => e,
            };

            let retries_left = self.max_attempts().saturating_sub(attempt);
            warn!(
                operation,
                attempt,
                retries_left,
                error = %error,
                "Remote call attempt failed"
            );

            if retries_left == 0 {
                return Err(McpError::RemoteCall {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message: error.to_string(),
                });
            }

            tokio::time::sleep(self.delay(attempt)).await;
        }
    }
}
