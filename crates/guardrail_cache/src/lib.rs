//! KV cache for the guardrail server.
//!
//! Backs the rate limiter's fixed windows, the rule-result cache, and
//! transient session metadata. The cache is never the source of truth:
//! callers must treat every error as "cache unavailable" and decide
//! fail-open (result caching) or fail-closed (rate limiting) themselves.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "redis-cache")]
mod redis_cache;
#[cfg(feature = "redis-cache")]
pub use redis_cache::RedisCache;

/// Cache operation errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache operation failed: {0}")]
    Operation(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Shared KV interface.
///
/// `incr_window` is the primitive the rate limiter needs: atomically
/// increment a counter that expires `window` after its first increment,
/// returning the post-increment value.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;
}

const SHARD_COUNT: usize = 16;

struct Entry {
    value: String,
    counter: u64,
    expires_at: Instant,
}

/// In-process cache: sharded `Mutex<HashMap>` with lazy expiry.
///
/// The default backend for single-node deployments and tests. Multi-node
/// deployments configure the Redis backend instead so rate-limit windows
/// are shared.
pub struct MemoryCache {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hash = 0usize;
        for byte in key.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as usize);
        }
        &self.shards[hash % SHARD_COUNT]
    }

    fn lock_shard<'a>(
        &'a self,
        key: &str,
    ) -> Result<std::sync::MutexGuard<'a, HashMap<String, Entry>>> {
        self.shard(key)
            .lock()
            .map_err(|_| CacheError::Operation("cache shard lock poisoned".to_string()))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut shard = self.lock_shard(key)?;
        match shard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                shard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut shard = self.lock_shard(key)?;
        shard.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                counter: 0,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let mut shard = self.lock_shard(key)?;
        let now = Instant::now();
        let entry = shard.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            counter: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            // Window elapsed; start a fresh one.
            entry.counter = 0;
            entry.expires_at = now + window;
        }
        entry.counter += 1;
        Ok(entry.counter)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut shard = self.lock_shard(key)?;
        shard.remove(key);
        Ok(())
    }
}
