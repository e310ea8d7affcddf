//! Bounded retry with exponential backoff for remote calls.
use crate::error::{DemError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Used for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay to wait before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let cap = self.max_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        let delay = (base * self.backoff_multiplier.powi(exponent)).min(cap);
        let jitter = delay * self.jitter_factor * (rand::random::<f64>() - 0.5);

        Duration::from_millis((delay + jitter).max(0.0).round() as u64)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, what, DemError::is_retryable, op).await
}

/// Like [`with_retry`], with a caller supplied notion of what is retryable.
pub async fn retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    what: &str,
    retryable: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&DemError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && retryable(&err) => {
                let delay = config.backoff_delay(attempt);
                warn!(
                    "{what} failed (attempt {attempt}/{max_attempts}): {err}; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
