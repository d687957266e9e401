//! Bounded retry with backoff notification, shared by both pipelines

use crate::config::CrawlerConfig;
use crate::HarvestError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Emitted before every re-attempt of a failed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    pub url: String,

    /// The attempt that just failed (1-based)
    pub attempt: u32,

    /// Attempts still available after this one
    pub remaining: u32,

    /// Display form of the failure
    pub error: String,
}

/// Caller-supplied hook receiving every [`RetryNotice`]
pub type RetryObserver = Arc<dyn Fn(&RetryNotice) + Send + Sync>;

/// Retry budget and backoff shared by the request and download pipelines
#[derive(Clone)]
pub struct RetryPolicy {
    retries: u32,
    config: CrawlerConfig,
    observer: Option<RetryObserver>,
}

impl RetryPolicy {
    pub fn new(config: &CrawlerConfig, observer: Option<RetryObserver>) -> Self {
        Self {
            retries: config.retry,
            config: config.clone(),
            observer,
        }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Runs `operation` until it succeeds or the budget is exhausted
    ///
    /// Attempts are strictly sequential. Cancellation ends the loop
    /// immediately; any other failure is retried and the last one is wrapped
    /// in [`HarvestError::Exhausted`] once no attempts remain.
    pub async fn run<T, F, Fut>(
        &self,
        token: &CancellationToken,
        url: &str,
        mut operation: F,
    ) -> Result<T, HarvestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            if token.is_cancelled() {
                return Err(HarvestError::Cancelled {
                    url: url.to_string(),
                });
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if error.is_cancelled() {
                return Err(error);
            }

            let remaining = max_attempts - attempt;
            if remaining == 0 {
                return Err(HarvestError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let notice = RetryNotice {
                url: url.to_string(),
                attempt,
                remaining,
                error: error.to_string(),
            };
            tracing::warn!(
                "Attempt {} for {} failed ({} left): {}",
                notice.attempt,
                notice.url,
                notice.remaining,
                notice.error
            );
            if let Some(observer) = &self.observer {
                observer(&notice);
            }

            let delay = self.config.backoff(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(HarvestError::Cancelled { url: url.to_string() });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            attempt += 1;
        }
    }
}

/// Runs one attempt under the shared cancellation token and a timeout
///
/// Cancellation wins over completion when both are ready.
pub(crate) async fn guarded<T, Fut>(
    token: &CancellationToken,
    timeout: Duration,
    url: &str,
    attempt: Fut,
) -> Result<T, HarvestError>
where
    Fut: Future<Output = Result<T, HarvestError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(HarvestError::Cancelled { url: url.to_string() }),
        outcome = tokio::time::timeout(timeout, attempt) => match outcome {
            Ok(result) => result,
            Err(_) => Err(HarvestError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}
