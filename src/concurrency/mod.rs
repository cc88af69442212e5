pub mod guard;
pub mod lock;

pub use guard::OptimisticGuard;
pub use lock::{DistributedLock, LockError, LockLease, LockStore, MemoryLockStore, RedisLockStore};
