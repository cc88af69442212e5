// ============================================================================
// Read Cache
// ============================================================================
//
// Read-through, write-invalidate. Entries are never updated in place: a
// mutation deletes the order's detail entry, the owner's list pages, and the
// statistics entries; the next read repopulates them.
//
//   order:detail:{order_id}                          ~1h
//   order:list:{user_id|all}:{status|any}:{page}:{size}  ~10m
//   order:stats:{user_id|all}                        ~5m
//
// Population after a miss runs in a spawned task. A populate racing with an
// invalidation can leave one stale entry; its TTL bounds how long it lives.
//
// ============================================================================

pub mod store;

pub use store::{CacheError, CacheStore, MemoryCacheStore, RedisCacheStore};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::errors::AppError;
use crate::metrics::Metrics;
use crate::storage::OrderQuery;

#[derive(Clone)]
pub struct OrderCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheConfig,
    metrics: Arc<Metrics>,
}

fn owner(user_id: Option<Uuid>) -> String {
    user_id.map_or_else(|| "all".to_string(), |id| id.to_string())
}

impl OrderCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheConfig, metrics: Arc<Metrics>) -> Self {
        Self { store, ttls, metrics }
    }

    pub fn order_key(order_id: Uuid) -> String {
        format!("order:detail:{order_id}")
    }

    pub fn list_prefix(user_id: Option<Uuid>) -> String {
        format!("order:list:{}:", owner(user_id))
    }

    pub fn list_key(query: &OrderQuery) -> String {
        let status = query.status.map_or("any", |s| s.as_str());
        format!(
            "{}{status}:{}:{}",
            Self::list_prefix(query.user_id),
            query.page,
            query.page_size
        )
    }

    pub fn stats_key(user_id: Option<Uuid>) -> String {
        format!("order:stats:{}", owner(user_id))
    }

    pub fn order_ttl(&self) -> Duration {
        self.ttls.order_ttl
    }

    pub fn list_ttl(&self) -> Duration {
        self.ttls.list_ttl
    }

    pub fn stats_ttl(&self) -> Duration {
        self.ttls.stats_ttl
    }

    /// Serve `key` from the cache, or call `load` and populate in the
    /// background. Cache failures degrade to a plain load.
    pub async fn read_through<T, F, Fut>(
        &self,
        kind: &'static str,
        key: String,
        ttl: Duration,
        load: F,
    ) -> Result<T, AppError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.metrics.record_cache_lookup(kind, true);
                    return Ok(value);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Cache read failed, loading from storage"),
        }
        self.metrics.record_cache_lookup(kind, false);

        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                let store = self.store.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.set(&key, raw, ttl).await {
                        tracing::warn!(key = %key, error = %e, "Cache populate failed");
                    }
                });
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "Cache value not serializable"),
        }

        Ok(value)
    }

    /// Drop every entry a mutation of `order_id` (owned by `user_id`) could
    /// have made stale.
    pub async fn invalidate_order(&self, order_id: Uuid, user_id: Uuid) {
        let keys = vec![
            Self::order_key(order_id),
            Self::stats_key(Some(user_id)),
            Self::stats_key(None),
        ];
        if let Err(e) = self.store.delete(&keys).await {
            tracing::warn!(order_id = %order_id, error = %e, "Cache invalidation failed");
        }

        for prefix in [Self::list_prefix(Some(user_id)), Self::list_prefix(None)] {
            if let Err(e) = self.store.delete_prefix(&prefix).await {
                tracing::warn!(prefix = %prefix, error = %e, "Cache list sweep failed");
            }
        }
    }
}
