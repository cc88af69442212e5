use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Distributed Lock Service
// ============================================================================
//
// Acquire: SET key token NX PX ttl. Fails fast when the key is held.
// Release: delete the key only while it still holds our token, so a holder
//          whose lease expired (and was re-acquired elsewhere) cannot release
//          someone else's lock.
//
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("Resource busy: {key}")]
    Busy { key: String },

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with expiry unless it already exists.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` if and only if its value equals `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

// ----------------------------------------------------------------------------
// Redis backend
// ----------------------------------------------------------------------------

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockStore {
    conn: MultiplexedConnection,
    release_script: redis::Script,
}

impl RedisLockStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release_script: redis::Script::new(COMPARE_AND_DELETE),
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

// ----------------------------------------------------------------------------
// In-process backend
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        let owned = entries
            .get(key)
            .is_some_and(|(held, expires_at)| held == token && *expires_at > Instant::now());
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}

// ----------------------------------------------------------------------------
// Lock handle
// ----------------------------------------------------------------------------

/// Proof of acquisition. Only the token inside can release the lock.
#[derive(Debug)]
pub struct LockLease {
    pub key: String,
    token: String,
    acquired_at: Instant,
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn order_key(order_id: Uuid) -> String {
        format!("lock:order:{order_id}")
    }

    pub async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
        let token = Uuid::new_v4().to_string();
        if !self.store.try_acquire(key, &token, self.ttl).await? {
            return Err(LockError::Busy { key: key.to_string() });
        }
        Ok(LockLease {
            key: key.to_string(),
            token,
            acquired_at: Instant::now(),
        })
    }

    /// Returns false when the lease had already lapsed and the key was no
    /// longer ours to delete.
    pub async fn release(&self, lease: LockLease) -> Result<bool, LockError> {
        let released = self.store.release(&lease.key, &lease.token).await?;
        if !released {
            tracing::warn!(
                key = %lease.key,
                held_ms = lease.acquired_at.elapsed().as_millis() as u64,
                "Lock lease expired before release"
            );
        }
        Ok(released)
    }
}
