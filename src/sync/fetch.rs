use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FeedError;
use crate::types::now_unix_ms;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_BACKOFF_MS: [u64; 3] = [100, 200, 400];
pub const DEFAULT_TOTAL_BUDGET_MS: u64 = 10_000;

const MUTATION_MAX_RETRIES: u32 = 2;
const MUTATION_BACKOFF_MS: [u64; 3] = [500, 1_000, 2_000];
const MUTATION_TOTAL_BUDGET_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so `max_retries = 2` allows three
    /// calls in total.
    pub max_retries: u32,
    pub backoff_ms: Vec<u64>,
    pub total_budget_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            total_budget_ms: DEFAULT_TOTAL_BUDGET_MS,
        }
    }
}

impl RetryPolicy {
    /// Slower schedule with a generous budget for instance mutations.
    pub fn mutation() -> Self {
        Self {
            max_retries: MUTATION_MAX_RETRIES,
            backoff_ms: MUTATION_BACKOFF_MS.to_vec(),
            total_budget_ms: MUTATION_TOTAL_BUDGET_MS,
        }
    }

    /// Delay before the given 1-based retry. The base comes from the backoff
    /// table (clamped to its last entry) plus up to 25% clock-derived jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let index = (retry.saturating_sub(1) as usize).min(self.backoff_ms.len().saturating_sub(1));
        let base = self.backoff_ms.get(index).copied().unwrap_or(0);
        let jitter = (now_unix_ms() as u64) % (base / 4 + 1);
        Duration::from_millis(base + jitter)
    }
}

/// Terminal result of a retried fetch. Cancellation is not an error: callers
/// discard cancelled work silently instead of surfacing a failure.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Success(T),
    Failed(FeedError),
    Cancelled,
}

impl<T> FetchOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs `operation` until it succeeds, fails terminally, exhausts the retry
/// policy, or the token fires. The wall-clock budget bounds the whole loop,
/// attempts included.
pub async fn fetch_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> FetchOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    let started = Instant::now();
    let budget = Duration::from_millis(policy.total_budget_ms);
    let mut retry = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!(label, "fetch cancelled before attempt");
            return FetchOutcome::Cancelled;
        }
        let Some(remaining) = budget.checked_sub(started.elapsed()) else {
            return FetchOutcome::Failed(FeedError::Timeout(format!(
                "{label}: retry budget exhausted"
            )));
        };

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return FetchOutcome::Cancelled,
            attempt = tokio::time::timeout(remaining, operation()) => attempt,
        };
        let result = match attempt {
            Ok(inner) => inner,
            Err(_) => Err(FeedError::Timeout(format!(
                "{label}: attempt exceeded remaining budget"
            ))),
        };

        match result {
            Ok(value) => return FetchOutcome::Success(value),
            Err(error) if !error.is_retryable() => {
                debug!(label, error = %error, "fetch failed terminally");
                return FetchOutcome::Failed(error);
            }
            Err(error) => {
                if retry >= policy.max_retries {
                    debug!(label, retries = retry, error = %error, "fetch exhausted retries");
                    return FetchOutcome::Failed(error);
                }
                retry += 1;
                let delay = policy.backoff_delay(retry);
                if started.elapsed() + delay >= budget {
                    return FetchOutcome::Failed(FeedError::Timeout(format!(
                        "{label}: retry budget exhausted"
                    )));
                }
                debug!(
                    label,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
