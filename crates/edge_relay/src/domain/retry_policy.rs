use common::domain::{DomainError, DomainResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether a failed attempt is worth repeating
pub type RetryPredicate = Arc<dyn Fn(&DomainError) -> bool + Send + Sync>;

/// Bounded exponential backoff shared by every HTTP call site.
///
/// Attempt `n` (1-based) that fails with a retryable error waits
/// `base_delay * 2^(n-1)`, capped at `max_delay`, before attempt `n + 1`.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            retryable: Arc::new(DomainError::is_retryable),
        }
    }

    /// Replace the retryable predicate (defaults to `DomainError::is_retryable`)
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DomainError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &DomainError) -> bool {
        (self.retryable)(error)
    }

    /// Delay to wait after the given failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> DomainResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && self.is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation = %operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        operation = %operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}
