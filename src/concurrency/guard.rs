use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use super::lock::DistributedLock;
use crate::errors::AppError;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Optimistic Concurrency Guard
// ============================================================================
//
// lock(order) -> [read -> validate -> conditional write]* -> unlock
//
// The lock bounds contention; the version check in the conditional write is
// what actually rejects a lost update. A version conflict re-runs the whole
// cycle up to the retry bound, then surfaces as ConcurrentModification. The
// lock is released on every path, success or failure.
//
// ============================================================================

#[derive(Clone)]
pub struct OptimisticGuard {
    lock: DistributedLock,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
}

impl OptimisticGuard {
    pub fn new(lock: DistributedLock, retry: RetryConfig, metrics: Arc<Metrics>) -> Self {
        Self { lock, retry, metrics }
    }

    /// Run `cycle` under the order lock. `cycle` receives the 1-based attempt
    /// number and must reload state on every call.
    pub async fn run<T, F, Fut>(&self, order_id: Uuid, operation: &'static str, mut cycle: F) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let key = DistributedLock::order_key(order_id);
        let lease = match self.lock.acquire(&key).await {
            Ok(lease) => lease,
            Err(err) => {
                let err = AppError::from(err);
                if matches!(err, AppError::ResourceBusy(_)) {
                    self.metrics.record_lock_busy(operation);
                    tracing::warn!(order_id = %order_id, operation, "Order lock busy");
                }
                return Err(err);
            }
        };

        let metrics = &self.metrics;
        let outcome = retry_on_transient(self.retry.clone(), |attempt| {
            let fut = cycle(attempt);
            async move {
                let result = fut.await;
                if let Err(AppError::VersionConflict { expected, .. }) = &result {
                    metrics.record_version_conflict(operation);
                    tracing::warn!(order_id = %order_id, operation, attempt, expected, "Version conflict");
                }
                result
            }
        })
        .await;

        if let Err(err) = self.lock.release(lease).await {
            tracing::warn!(order_id = %order_id, error = %err, "Failed to release order lock");
        }

        match outcome {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed(AppError::VersionConflict { .. }) => Err(AppError::ConcurrentModification(order_id)),
            RetryResult::Failed(err) | RetryResult::PermanentFailure(err) => Err(err),
        }
    }
}
