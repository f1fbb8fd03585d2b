// Retry / backoff policy - pure functions over the attempt error
use rand::Rng;
use std::time::Duration;

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Archive,
}

/// Default curve: `n^4 + 15 + rand[0, 30) * (n + 1)` seconds, `n` being the
/// number of retries already made.
pub fn default_retry_delay(retried: u32) -> Duration {
    let n = retried as u64;
    let jitter = rand::thread_rng().gen_range(0..30u64);
    let secs = n
        .saturating_pow(4)
        .saturating_add(15)
        .saturating_add(jitter.saturating_mul(n + 1));
    Duration::from_secs(secs)
}

pub fn retry_delay(retried: u32, error: &TaskError) -> Duration {
    error
        .retry_after()
        .unwrap_or_else(|| default_retry_delay(retried))
}

/// Decide what the broker does with a failed attempt.
///
/// Every retry, backpressure included, spends one unit of the budget.
pub fn decide(error: &TaskError, retried: u32, max_retry: u32) -> RetryDecision {
    if error.skips_retry() || retried >= max_retry {
        return RetryDecision::Archive;
    }
    RetryDecision::Retry {
        delay: retry_delay(retried, error),
    }
}
