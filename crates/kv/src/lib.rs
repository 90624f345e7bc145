//! Facade over the shared key-value service used for cross-replica
//! coordination: access-credential storage, refresh locking, response
//! caching, rate-limit counters, webhook replay suppression and write
//! idempotency markers.
//!
//! A miss is `Ok(None)`; connectivity problems are `Error::Unavailable`.
//! Callers decide per use whether to fail open (rate limiting, caching) or
//! closed (credential storage).

use std::time::Duration;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("value under {0:?} is not a counter")]
    NotACounter(String),
}

/// The store operations the adapter relies on. `set_nx` is atomic
/// create-if-absent, which is the sole serialization primitive for
/// cross-replica coordination (refresh locks, idempotency markers,
/// replay suppression).
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Create `key` only if absent. Returns whether this call created it.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Increment the counter under `key`, setting `ttl` when this increment
    /// creates it. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Remaining lifetime of `key`, or None if it does not exist or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Connectivity probe, used by the liveness endpoint and at boot.
    async fn ping(&self) -> Result<()>;
}

/// Open a store from a URL. `redis://` and `rediss://` dial Redis;
/// `memory://` yields the in-process store used by tests and stdio-only
/// development.
pub async fn open(url: &str) -> Result<std::sync::Arc<dyn Store>> {
    if url.starts_with("memory://") {
        return Ok(std::sync::Arc::new(MemoryStore::new()));
    }
    Ok(std::sync::Arc::new(RedisStore::connect(url).await?))
}
