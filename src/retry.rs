//! Retry policies shared by the submission pipeline and the nonce synchronizer
//!
//! Two policies exist:
//! - [`ConstantBackoff`]: fixed interval, bounded number of retries
//! - [`ExponentialBackoff`]: growing randomized interval, bounded only by total
//!   elapsed time

use crate::error::InjectorError;

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A retry delay policy
pub trait Backoff {
    /// Delay before the next attempt, or `None` when the policy is exhausted
    fn next_delay(&mut self) -> Option<Duration>;
}

/// Fixed interval between attempts, at most `max_retries` retries
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    interval: Duration,
    max_retries: u32,
    retries: u32,
}

impl ConstantBackoff {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            retries: 0,
        }
    }
}

impl Backoff for ConstantBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        Some(self.interval)
    }
}

/// Settings for [`ExponentialBackoff`]
#[derive(Debug, Clone)]
pub struct ExponentialConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Jitter factor in `[0, 1)`; each delay is drawn from `interval * (1 ± factor)`
    pub randomization: f64,
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Duration,
}

impl Default for ExponentialConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

/// Exponentially growing delays with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: ExponentialConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: ExponentialConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            started: Instant::now(),
        }
    }

    fn randomize(&self, interval: Duration) -> Duration {
        let factor = self.config.randomization.clamp(0.0, 0.99);
        if factor == 0.0 {
            return interval;
        }
        let scale = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
        interval.mul_f64(scale)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.config.max_elapsed {
            return None;
        }
        let delay = self.randomize(self.current);
        let next = self.current.mul_f64(self.config.multiplier.max(1.0));
        self.current = next.min(self.config.max_interval);
        Some(delay)
    }
}

/// Run `operation` until it succeeds or `backoff` is exhausted
///
/// Errors that are not retryable end the loop at once. Returns the last error
/// together with the number of attempts made.
pub async fn retry<B, T, F, Fut>(
    mut backoff: B,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError>
where
    B: Backoff,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InjectorError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempts);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                return Err(RetryError {
                    attempts,
                    last: e,
                })
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        "{} failed (attempt {}). Retrying in {:?}: {}",
                        operation_name, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(RetryError {
                        attempts,
                        last: e,
                    })
                }
            },
        }
    }
}

/// Failure after the retry policy gave up
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryError {
    pub attempts: u32,
    pub last: InjectorError,
}
