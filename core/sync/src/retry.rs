//! Retry strategy with exponential backoff for recoverable record failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use intsync_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay_ms: u64,
    /// Maximum delay (cap for exponential growth).
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Spread each delay over `[delay, delay * backoff_multiplier]`.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_ms(delay);
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after `attempt` (1-based) has failed:
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_delay = self.max_delay_ms as f64;
        let base_delay =
            (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent)).min(max_delay);

        let final_delay = if self.jitter {
            let spread = self.backoff_multiplier.max(1.0) - 1.0;
            let jitter_factor = 1.0 + rand::random::<f64>() * spread;
            (base_delay * jitter_factor).min(max_delay)
        } else {
            base_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check the configuration for values that would stall or never retry.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::InvalidInput(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::InvalidInput(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Retry executor for running operations with retry logic.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying recoverable errors.
    ///
    /// Non-recoverable errors are returned immediately. After
    /// `max_attempts` failed attempts the last error is returned.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, Error::is_recoverable)
            .await
    }

    /// Execute with a custom retry condition.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    if attempt >= self.config.max_attempts {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
