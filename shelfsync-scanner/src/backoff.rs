use crate::error::FetchError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounded retry with exponential backoff.
///
/// `max_attempts` counts every attempt including the first one, so a policy
/// with `max_attempts = 4` and `base_delay_ms = 1000` waits 1s, 2s and 4s
/// between its four tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 500, 8_000)
    }
}

/// Final result of a retried operation plus how many tries it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, FetchError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry.min(20)));
        Duration::from_millis(exponential.min(self.max_delay_ms))
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Retried<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) if !err.is_retryable() || attempt >= max_attempts => {
                    debug!("{} gave up after {} attempt(s): {}", label, attempt, err);
                    return Retried {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let wait = self.delay(attempt - 1);
                    debug!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        label, attempt, max_attempts, err, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
