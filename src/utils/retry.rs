use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Bounded Retry With Randomized Backoff
// ============================================================================
//
// One combinator shared by every read-modify-write entry point. The closure
// receives the 1-based attempt number and must redo the whole cycle (reload,
// validate, write) on each call.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the uniform random delay added to every backoff
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: Duration::from_millis(30),
        }
    }
}

impl RetryConfig {
    /// Used for startup connections, where waiting is cheap and giving up is not.
    pub fn patient() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: Duration::from_millis(100),
        }
    }

    /// Used by tests: no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    fn backoff(&self, base: Duration) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn grow(&self, delay: Duration) -> Duration {
        Duration::from_millis((delay.as_millis() as f64 * self.multiplier) as u64).min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Every attempt failed with a retryable error; carries the last one
    Failed(E),
    /// A non-retryable error stopped the loop early
    PermanentFailure(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed(error) | RetryResult::PermanentFailure(error) => Err(error),
        }
    }
}

pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Retry every error until the attempt budget runs out.
pub async fn retry_with_backoff<F, Fut, T, E>(config: RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success(result);
            }
            Err(error) if attempt >= config.max_attempts => {
                tracing::error!(attempt, error = %error, "Operation failed after all retries");
                return RetryResult::Failed(error);
            }
            Err(error) => {
                let wait = config.backoff(delay);
                tracing::warn!(
                    attempt,
                    error = %error,
                    delay_ms = wait.as_millis() as u64,
                    "Operation failed, retrying after delay"
                );
                sleep(wait).await;
                delay = config.grow(delay);
            }
        }
    }
}

/// Retry only errors that report themselves as transient.
pub async fn retry_on_transient<F, Fut, T, E>(config: RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after transient failure");
                }
                return RetryResult::Success(result);
            }
            Err(error) if !error.is_transient() => return RetryResult::PermanentFailure(error),
            Err(error) if attempt >= config.max_attempts => {
                tracing::warn!(attempt, error = %error, "Transient failure persisted, giving up");
                return RetryResult::Failed(error);
            }
            Err(error) => {
                let wait = config.backoff(delay);
                tracing::debug!(
                    attempt,
                    error = %error,
                    delay_ms = wait.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );
                sleep(wait).await;
                delay = config.grow(delay);
            }
        }
    }
}
