/// Provider retry policy: exponential backoff with jitter
use crate::config::config::ProviderConfig;
use crate::config::types::ProviderError;
use crate::observability::metrics::get_metrics;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized in both directions, 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default())
    }
}

/// Final result of a retried call
#[derive(Clone, Debug, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, ProviderError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Retry immediately; used where waiting would only slow things down
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (0 for the first retry)
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        if let ProviderError::RateLimited {
            retry_after: Some(hint),
        } = error
        {
            return *hint;
        }

        let factor = 2u32.saturating_pow(retry.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = self.jitter * (fastrand::f64() * 2.0 - 1.0);
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }

    /// Call `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> std::result::Result<T, ProviderError>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1, &e);
                    log::debug!("Provider attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    get_metrics().provider_retries.inc();
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
