// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The batch cursor: resumable, non-overlapping id ranges over two tables.
//!
//! A [`Batcher`] hands out contiguous id ranges for an external scheduler to
//! process. It scans *two* tables at once: the source table (the records to
//! replicate) and the destination registry table (keyed by
//! `model_record_id`). The union matters because registry rows can reference
//! ids that no longer exist in the source (orphans) - a cursor that only
//! looked at the source would stall in front of them forever.
//!
//! # Cursor Semantics
//!
//! The cursor stores the **last id covered by a handed-out range** in a
//! volatile cache. The next range starts at `cursor + 1` (exclusive resume).
//!
//! ```text
//! next_range(1000) → 1..=1000 → persist cursor 1000
//!                    (cache evicted here = re-scan from minimum, idempotent)
//! next_range(1000) → 1001..=1843 → persist cursor 1843
//! next_range(1000) → None, cursor cleared (scan finished, next tick restarts)
//! ```
//!
//! # Range Construction
//!
//! For a batch starting at `first`, each side reports the last id within its
//! next `batch_size` ids and whether more ids exist beyond:
//!
//! - both sides have more ⇒ the *smaller* batch end (neither side skips ids)
//! - one side has more ⇒ that side's batch end
//! - neither has more ⇒ the largest remaining id across both (one final
//!   range that covers the stragglers, including far-out orphans)
//!
//! # Concurrency
//!
//! Advancing the cursor is a read-then-write against a cache key, not a
//! transaction. Two racing batchers may hand out overlapping ranges; that is
//! tolerated because re-syncing an already-synced id is a no-op.

use crate::cache::CursorCache;
use crate::error::{EngineError, Result};
use std::collections::BTreeSet;
use std::future::Future;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ordered view over the ids present in a table.
///
/// The source side is whatever storage holds the replicable records; the
/// destination side is the registry table's `model_record_id` column. The
/// trait keeps the batcher independent of where either actually lives.
pub trait IdTable: Send + Sync + 'static {
    /// Smallest id present, or `None` if the table is empty.
    fn min_id(&self) -> BoxFuture<'_, Result<Option<i64>>>;

    /// Scan forward from `from` (inclusive): the last id within the next
    /// `batch_size` ids, plus whether any ids exist beyond that batch.
    fn batch_end(&self, from: i64, batch_size: u32) -> BoxFuture<'_, Result<(Option<i64>, bool)>>;
}

/// In-memory [`IdTable`] for tests and standalone use.
#[derive(Default)]
pub struct MemoryIdTable {
    ids: Arc<RwLock<BTreeSet<i64>>>,
}

impl MemoryIdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        let table = Self::new();
        table.ids.write().await.extend(ids);
        table
    }

    pub async fn insert(&self, id: i64) {
        self.ids.write().await.insert(id);
    }

    pub async fn remove(&self, id: i64) {
        self.ids.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.ids.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ids.read().await.is_empty()
    }
}

impl IdTable for MemoryIdTable {
    fn min_id(&self) -> BoxFuture<'_, Result<Option<i64>>> {
        Box::pin(async move { Ok(self.ids.read().await.iter().next().copied()) })
    }

    fn batch_end(&self, from: i64, batch_size: u32) -> BoxFuture<'_, Result<(Option<i64>, bool)>> {
        Box::pin(async move {
            let ids = self.ids.read().await;
            let mut tail = ids.range(from..);
            let batch: Vec<i64> = tail.by_ref().take(batch_size as usize).copied().collect();
            let more = tail.next().is_some();
            Ok((batch.last().copied(), more))
        })
    }
}

/// Hands out monotonically advancing id ranges over source ∪ destination.
///
/// One `Batcher` per (record type, site) pair; the `key` keeps cursor cache
/// entries apart. Wrap in an `Arc` when multiple tasks share it.
pub struct Batcher {
    key: String,
    source: Arc<dyn IdTable>,
    destination: Arc<dyn IdTable>,
    cache: Arc<dyn CursorCache>,
}

impl Batcher {
    /// Create a batcher. `key` is an opaque identity string; it should be
    /// stable across restarts so the cursor survives process churn (as long
    /// as the cache itself does).
    pub fn new(
        key: impl Into<String>,
        source: Arc<dyn IdTable>,
        destination: Arc<dyn IdTable>,
        cache: Arc<dyn CursorCache>,
    ) -> Self {
        Self {
            key: key.into(),
            source,
            destination,
            cache,
        }
    }

    fn cache_key(&self) -> String {
        format!("{}:last_id", self.key)
    }

    /// Next contiguous id range to process, or `None` when the scan is done.
    ///
    /// Returning `None` also clears the cursor, so the *next* call restarts
    /// from the table minimum - the scan loops over the tables continuously.
    /// Ids within a range are intended to be processed in ascending order.
    ///
    /// # Errors
    ///
    /// Fails fast on `batch_size == 0`. Table errors propagate; cache errors
    /// do not (a dead cache degrades to cold starts).
    pub async fn next_range(&self, batch_size: u32) -> Result<Option<RangeInclusive<i64>>> {
        if batch_size == 0 {
            return Err(EngineError::InvalidArgument(
                "batch_size must be positive".to_string(),
            ));
        }

        let first = match self.cache.get(&self.cache_key()).await {
            Some(last) => last + 1,
            None => {
                // Cold start: the true minimum across both tables, so orphans
                // below the source minimum are still covered.
                let source_min = self.source.min_id().await?;
                let dest_min = self.destination.min_id().await?;
                match source_min.into_iter().chain(dest_min).min() {
                    Some(min) => {
                        info!(key = %self.key, start = min, "Batcher cold start");
                        crate::metrics::record_cursor_cold_start(&self.key);
                        min
                    }
                    None => return Ok(None), // Both tables empty
                }
            }
        };

        let (source_end, source_more) = self.source.batch_end(first, batch_size).await?;
        let (dest_end, dest_more) = self.destination.batch_end(first, batch_size).await?;

        let last = match (source_end, dest_end) {
            (Some(s), Some(d)) if source_more && dest_more => Some(s.min(d)),
            (Some(s), _) if source_more => Some(s),
            (_, Some(d)) if dest_more => Some(d),
            (s, d) => s.into_iter().chain(d).max(),
        };

        match last {
            Some(last) => {
                self.cache.set(&self.cache_key(), last).await;
                debug!(key = %self.key, first, last, "Handing out batch range");
                crate::metrics::record_next_range(&self.key, (last - first + 1) as u64);
                Ok(Some(first..=last))
            }
            None => {
                // Scan exhausted. Clear the cursor so the next call restarts
                // from the minimum and picks up rows created in the meantime.
                self.cache.clear(&self.cache_key()).await;
                debug!(key = %self.key, "Batch scan exhausted, cursor cleared");
                Ok(None)
            }
        }
    }

    /// Explicitly forget the cursor. The next [`next_range`](Self::next_range)
    /// call restarts from the true minimum.
    pub async fn reset(&self) {
        self.cache.clear(&self.cache_key()).await;
    }
}
