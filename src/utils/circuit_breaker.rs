use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker for Outbound Gateway Calls
// ============================================================================
//
// Closed   -> calls pass; consecutive trip-worthy failures are counted
// Open     -> calls rejected immediately until `open_timeout` elapses
// HalfOpen -> calls pass; `success_threshold` successes close the circuit,
//             one trip-worthy failure reopens it
//
// Which failures count is decided per call: a definitive decline from a healthy
// gateway must not open the circuit, a timeout must.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            config,
        }
    }

    /// Run `operation` if the circuit admits it. `trips` decides whether a
    /// returned error counts against the circuit.
    pub async fn call<Fut, T, E>(
        &self,
        operation: Fut,
        trips: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if trips(&err) {
                    self.record_failure().await;
                } else {
                    self.record_success().await;
                }
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = state.opened_at.map(|at| at.elapsed()).unwrap_or_default();
        if elapsed >= self.config.open_timeout {
            tracing::info!(breaker = self.name, "Circuit breaker half-open, probing");
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            Ok(())
        } else {
            Err(CircuitBreakerError::CircuitOpen)
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(breaker = self.name, "Circuit breaker closed");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;

        let reopen = match state.state {
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if reopen {
            tracing::warn!(
                breaker = self.name,
                failures = state.failure_count,
                "Circuit breaker opened"
            );
            state.state = CircuitState::Open;
            state.success_count = 0;
            state.opened_at = Some(Instant::now());
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                open_timeout,
                success_threshold: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("timeout") }, |_| true).await;
            assert!(result.is_err());
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, &str>(()) }, |_| true).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_non_tripping_errors_keep_circuit_closed() {
        let cb = breaker(2, Duration::from_secs(60));

        for _ in 0..5 {
            let _ = cb.call(async { Err::<(), _>("declined") }, |_| false).await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let cb = breaker(1, Duration::from_millis(50));

        let _ = cb.call(async { Err::<(), _>("down") }, |_| true).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Ok::<_, &str>(7) }, |_| true).await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
