// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Volatile cache backends for the batch cursor.
//!
//! The cursor is the only shared mutable state between concurrent batcher
//! invocations, and it is deliberately *not* durable: losing it only causes a
//! re-scan from the table minimum, and downstream sync is idempotent. So the
//! contract here is a plain get/set/clear with no durability guarantee, and
//! backend failures are absorbed as misses rather than surfaced.
//!
//! Two implementations:
//! - [`MemoryCursorCache`]: process-local, for tests and single-process use
//! - [`RedisCursorCache`]: shared across worker processes

use crate::cursor::BoxFuture;
use crate::error::EngineError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Volatile storage for batch cursor positions.
///
/// Implementations must treat backend outages as cache misses: `get` returns
/// `None`, `set`/`clear` log and move on. A batcher running against a dead
/// cache degrades to cold starts, never to an error.
pub trait CursorCache: Send + Sync + 'static {
    /// Read the cached value for `key`, or `None` on miss/outage.
    fn get(&self, key: &str) -> BoxFuture<'_, Option<i64>>;

    /// Store `value` under `key`. Best effort.
    fn set(&self, key: &str, value: i64) -> BoxFuture<'_, ()>;

    /// Remove `key`. Best effort.
    fn clear(&self, key: &str) -> BoxFuture<'_, ()>;
}

/// In-memory cursor cache.
///
/// Process-wide, lazily populated, explicitly clearable. Shared via `Arc`.
#[derive(Default)]
pub struct MemoryCursorCache {
    entries: Arc<RwLock<HashMap<String, i64>>>,
}

impl MemoryCursorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry. Used by tests to simulate cache eviction.
    pub async fn clear_all(&self) {
        self.entries.write().await.clear();
    }
}

impl CursorCache for MemoryCursorCache {
    fn get(&self, key: &str) -> BoxFuture<'_, Option<i64>> {
        let key = key.to_string();
        Box::pin(async move { self.entries.read().await.get(&key).copied() })
    }

    fn set(&self, key: &str, value: i64) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.insert(key, value);
        })
    }

    fn clear(&self, key: &str) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.remove(&key);
        })
    }
}

/// Redis-backed cursor cache, shared by a pool of worker processes.
///
/// Uses `ConnectionManager`, which reconnects automatically. Every operation
/// absorbs Redis errors: a GET failure is a miss (cold start), a SET/DEL
/// failure is logged and skipped. Values expire after `ttl_secs` so a
/// decommissioned batcher key does not linger forever.
pub struct RedisCursorCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisCursorCache {
    /// Default entry TTL: one day. The cursor is refreshed on every batch, so
    /// expiry only ever affects idle batchers.
    pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl_secs: Self::DEFAULT_TTL_SECS,
        }
    }

    pub fn with_ttl(conn: ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }
}

impl CursorCache for RedisCursorCache {
    fn get(&self, key: &str) -> BoxFuture<'_, Option<i64>> {
        let key = key.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            match conn.get::<_, Option<i64>>(&key).await {
                Ok(value) => value,
                Err(e) => {
                    // Treated as a miss: the batcher restarts from the minimum
                    let err = EngineError::cache("GET", e);
                    warn!(key = %key, error = %err, retryable = err.is_retryable(),
                        "Cursor cache GET failed, treating as miss");
                    None
                }
            }
        })
    }

    fn set(&self, key: &str, value: i64) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        let ttl = self.ttl_secs;
        let mut conn = self.conn.clone();
        Box::pin(async move {
            if let Err(e) = conn.set_ex::<_, _, ()>(&key, value, ttl).await {
                let err = EngineError::cache("SET", e);
                warn!(key = %key, value, error = %err, retryable = err.is_retryable(),
                    "Cursor cache SET failed, cursor not advanced");
            } else {
                debug!(key = %key, value, "Cursor advanced");
            }
        })
    }

    fn clear(&self, key: &str) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            if let Err(e) = conn.del::<_, ()>(&key).await {
                let err = EngineError::cache("DEL", e);
                warn!(key = %key, error = %err, retryable = err.is_retryable(),
                    "Cursor cache DEL failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_get_set() {
        let cache = MemoryCursorCache::new();

        assert_eq!(cache.get("a").await, None);

        cache.set("a", 42).await;
        assert_eq!(cache.get("a").await, Some(42));

        cache.set("a", 100).await;
        assert_eq!(cache.get("a").await, Some(100));
    }

    #[tokio::test]
    async fn test_memory_cache_clear() {
        let cache = MemoryCursorCache::new();

        cache.set("a", 1).await;
        cache.set("b", 2).await;

        cache.clear("a").await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(2));
    }

    #[tokio::test]
    async fn test_memory_cache_clear_all() {
        let cache = MemoryCursorCache::new();

        cache.set("a", 1).await;
        cache.set("b", 2).await;
        cache.clear_all().await;

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_clear_missing_key() {
        let cache = MemoryCursorCache::new();
        // Clearing a key that was never set is a no-op
        cache.clear("missing").await;
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_keys_are_independent() {
        let cache = MemoryCursorCache::new();
        cache.set("batcher/a", 10).await;
        cache.set("batcher/b", 20).await;

        assert_eq!(cache.get("batcher/a").await, Some(10));
        assert_eq!(cache.get("batcher/b").await, Some(20));
    }
}
