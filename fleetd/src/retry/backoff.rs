//! Exponential backoff and retry

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Retry options for remote calls
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    /// Options that never sleep, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Calculate exponential backoff delay for a zero-based attempt
pub fn calc_exp_backoff(options: &RetryOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt ceiling is reached. The backoff sleep is the only suspension
/// point besides the operation itself.
pub async fn retry_with_backoff<T, E, Op, Fut, R>(
    options: &RetryOptions,
    label: &str,
    is_retryable: R,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = label, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 < max_attempts && is_retryable(&e) => {
                let delay = calc_exp_backoff(options, attempt);
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
