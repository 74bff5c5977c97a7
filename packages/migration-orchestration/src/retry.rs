//! Exponential backoff retry

use crate::config::RetryConfig;
use crate::error::{ErrorCategory, MigrationError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest random extra delay, as a fraction of the computed delay
const MAX_JITTER: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub retryable: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            exponential_base: config.exponential_base,
            jitter: config.jitter,
            retryable: config.retryable.clone(),
        }
    }

    pub fn is_retryable(&self, error: &MigrationError) -> bool {
        self.retryable.contains(&error.category())
    }

    /// Delay after the `attempt`-th failed invocation (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (self.base_delay.as_millis() as f64
            * self.exponential_base.powi(exponent))
        .min(max_ms);

        let final_ms = if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..=MAX_JITTER);
            (delay_ms * factor).min(max_ms)
        } else {
            delay_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Invoke `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` invocations have been made
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.is_retryable(&error) {
                return Err(error);
            }

            if attempt >= self.max_attempts {
                warn!(
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(MigrationError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for(attempt);
            debug!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after retryable error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
