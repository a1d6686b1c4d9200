use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{config::duration_ms, error::Error, storage::StoreError};

/// Bounded retry with exponential backoff for catalog and store calls.
///
/// Every attempt runs under the per-call timeout; an expired timeout counts
/// as a retryable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub init_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Growth factor applied to the backoff after each failed attempt.
    pub base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff to wait after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.init_backoff.as_secs_f64() * self.base.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Runs `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        timeout: Duration,
        mut f: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut failures = 0;
        loop {
            let err = match tokio::time::timeout(timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(source)) => Error::Store { op, source },
                Err(_) => Error::Timeout { op, timeout },
            };
            failures += 1;
            if !err.is_retryable() || failures >= max_attempts {
                return Err(err);
            }
            let backoff = self.backoff(failures);
            tracing::debug!(op, attempt = failures, ?backoff, error = %err, "retrying");
            tokio::time::sleep(backoff).await;
        }
    }
}
