// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry persistence backed by SQLite.
//!
//! One row per replicable record (see [`Registry`](crate::registry::Registry)).
//! The schema is created on open; WAL mode keeps readers and the single
//! writer out of each other's way.
//!
//! # Claim Queries
//!
//! [`verification_pending_batch`](RegistryStore::verification_pending_batch)
//! and [`verification_failed_batch`](RegistryStore::verification_failed_batch)
//! are the concurrency boundary for verification workers: each is a single
//! `UPDATE ... WHERE id IN (SELECT ... LIMIT n) RETURNING *` statement, so
//! selecting a batch and flipping it to `verification_started` is one atomic
//! operation and two workers can never claim the same row.
//!
//! The sync-side finders (`find_registries_never_attempted_sync`,
//! `find_registries_needs_sync_again`) only *select* candidates; the mark
//! step there is the worker's `start_sync`, which is guarded by the current
//! state. An `except_ids` list keeps concurrent schedulers from re-selecting
//! ids already in flight.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Write paths retry with capped exponential backoff.

use crate::config::EngineConfig;
use crate::cursor::{BoxFuture, IdTable};
use crate::error::{EngineError, Result};
use crate::registry::{truncate_message, Registry, SyncState, VerificationState};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Current time as UTC milliseconds, the unit used for all persisted
/// timestamps.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Field/direction pairs accepted by [`RegistryStore::ordered_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    IdAsc,
    IdDesc,
    LastSyncedAtAsc,
    LastSyncedAtDesc,
    RetryAtAsc,
    VerifiedAtAsc,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::IdAsc => "id ASC",
            Self::IdDesc => "id DESC",
            Self::LastSyncedAtAsc => "last_synced_at ASC NULLS FIRST",
            Self::LastSyncedAtDesc => "last_synced_at DESC NULLS LAST",
            Self::RetryAtAsc => "retry_at ASC NULLS FIRST",
            Self::VerifiedAtAsc => "verified_at ASC NULLS FIRST",
        }
    }
}

/// SQLite-backed registry row set.
pub struct RegistryStore {
    pool: SqlitePool,
    config: EngineConfig,
    path: String,
}

impl RegistryStore {
    /// Open (creating if missing) the registry database at the given path.
    pub async fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening registry store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| EngineError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_record_id INTEGER NOT NULL UNIQUE,
                state INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_at INTEGER,
                last_sync_failure TEXT,
                last_synced_at INTEGER,
                verification_state INTEGER NOT NULL DEFAULT 4,
                verification_checksum TEXT,
                verification_checksum_mismatched TEXT,
                checksum_mismatch INTEGER NOT NULL DEFAULT 0,
                verification_retry_count INTEGER NOT NULL DEFAULT 0,
                verification_retry_at INTEGER,
                verification_failure TEXT,
                verification_started_at INTEGER,
                verified_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_registries_state ON registries (state)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_registries_verification_state \
             ON registries (verification_state)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            config,
            path: path_str,
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Registry store closed");
    }

    // =========================================================================
    // Row access
    // =========================================================================

    /// Create the registry row for a source record if it does not exist yet,
    /// and return it. Idempotent: re-ensuring an existing row is a no-op.
    pub async fn ensure(&self, model_record_id: i64) -> Result<Registry> {
        let pool = &self.pool;
        let now = now_ms();

        execute_with_retry("registry_ensure", || async move {
            sqlx::query(
                "INSERT INTO registries (model_record_id, created_at) VALUES (?, ?) \
                 ON CONFLICT(model_record_id) DO NOTHING",
            )
            .bind(model_record_id)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        self.get_by_model_record_id(model_record_id)
            .await?
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "registry for model record {} missing after insert",
                    model_record_id
                ))
            })
    }

    pub async fn get(&self, id: i64) -> Result<Option<Registry>> {
        let row = sqlx::query_as::<_, Registry>("SELECT * FROM registries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_by_model_record_id(&self, model_record_id: i64) -> Result<Option<Registry>> {
        let row =
            sqlx::query_as::<_, Registry>("SELECT * FROM registries WHERE model_record_id = ?")
                .bind(model_record_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    /// Re-read a row from storage into the caller's copy.
    pub(crate) async fn reload(&self, registry: &mut Registry) -> Result<()> {
        let fresh = self.get(registry.id).await?.ok_or_else(|| {
            EngineError::Internal(format!("registry {} disappeared", registry.id))
        })?;
        *registry = fresh;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM registries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_by_state(&self, state: SyncState) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM registries WHERE state = ?")
            .bind(state.as_i16())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Read-only scopes
    // =========================================================================

    /// Rows in any sync state other than `pending`.
    pub async fn not_pending(&self) -> Result<Vec<Registry>> {
        let rows = sqlx::query_as::<_, Registry>(
            "SELECT * FROM registries WHERE state != ? ORDER BY id ASC",
        )
        .bind(SyncState::Pending.as_i16())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All rows in ascending id order.
    pub async fn ordered_by_id(&self) -> Result<Vec<Registry>> {
        self.ordered_by(SortOrder::IdAsc).await
    }

    /// All rows in the given order.
    pub async fn ordered_by(&self, order: SortOrder) -> Result<Vec<Registry>> {
        let sql = format!("SELECT * FROM registries ORDER BY {}", order.sql());
        let rows = sqlx::query_as::<_, Registry>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// `started` rows whose `last_synced_at` is older than the sync timeout:
    /// the worker died mid-sync and the claim is stale.
    pub async fn sync_timed_out(&self) -> Result<Vec<Registry>> {
        let cutoff = now_ms() - self.config.sync_timeout().as_millis() as i64;
        let rows = sqlx::query_as::<_, Registry>(
            "SELECT * FROM registries \
             WHERE state = ? AND (last_synced_at IS NULL OR last_synced_at <= ?) \
             ORDER BY id ASC",
        )
        .bind(SyncState::Started.as_i16())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Rows whose verification is anything but `verification_disabled`.
    pub async fn verification_not_disabled(&self) -> Result<Vec<Registry>> {
        let rows = sqlx::query_as::<_, Registry>(
            "SELECT * FROM registries WHERE verification_state != ? ORDER BY id ASC",
        )
        .bind(VerificationState::Disabled.as_i16())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Rows whose verification is anything but `verification_pending`.
    pub async fn verification_not_pending(&self) -> Result<Vec<Registry>> {
        let rows = sqlx::query_as::<_, Registry>(
            "SELECT * FROM registries WHERE verification_state != ? ORDER BY id ASC",
        )
        .bind(VerificationState::Pending.as_i16())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Failed rows whose backoff has elapsed.
    pub async fn retry_due(&self) -> Result<Vec<Registry>> {
        let rows = sqlx::query_as::<_, Registry>(
            "SELECT * FROM registries \
             WHERE state = ? AND (retry_at IS NULL OR retry_at <= ?) \
             ORDER BY retry_at ASC NULLS FIRST, id ASC",
        )
        .bind(SyncState::Failed.as_i16())
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Verified rows whose `verified_at` is older than the re-verification
    /// interval. [`reverify_batch`](Self::reverify_batch) is the bounded
    /// write-side counterpart.
    pub async fn needs_reverification(&self) -> Result<Vec<Registry>> {
        let cutoff = now_ms() - self.config.reverification_interval().as_millis() as i64;
        let rows = sqlx::query_as::<_, Registry>(
            "SELECT * FROM registries \
             WHERE state = ? AND verification_state = ? AND verified_at <= ? \
             ORDER BY verified_at ASC",
        )
        .bind(SyncState::Synced.as_i16())
        .bind(VerificationState::Succeeded.as_i16())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Sync candidate finders
    // =========================================================================

    /// Pending rows with no prior sync activity: cold sync candidates,
    /// ascending id order. Does not mark; the worker's `start_sync` is the
    /// claim step.
    pub async fn find_registries_never_attempted_sync(
        &self,
        batch_size: u32,
        except_ids: &[i64],
    ) -> Result<Vec<Registry>> {
        check_batch_size(batch_size)?;
        let (clause, _) = not_in_clause("id", except_ids);
        let sql = format!(
            "SELECT * FROM registries \
             WHERE state = ? AND last_synced_at IS NULL AND retry_count = 0 {} \
             ORDER BY id ASC LIMIT ?",
            clause
        );
        let mut query = sqlx::query_as::<_, Registry>(&sql).bind(SyncState::Pending.as_i16());
        for id in except_ids {
            query = query.bind(id);
        }
        let rows = query.bind(batch_size as i64).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Rows that already attempted or completed a sync and need another pass:
    /// failures whose backoff has elapsed, plus rows bumped back to pending
    /// after prior activity (warm resync). Ordered by `retry_at` with NULLs
    /// first so never-scheduled resyncs go before backed-off failures.
    pub async fn find_registries_needs_sync_again(
        &self,
        batch_size: u32,
        except_ids: &[i64],
    ) -> Result<Vec<Registry>> {
        check_batch_size(batch_size)?;
        let (clause, _) = not_in_clause("id", except_ids);
        let sql = format!(
            "SELECT * FROM registries \
             WHERE ((state = ? AND (retry_at IS NULL OR retry_at <= ?)) \
                 OR (state = ? AND (last_synced_at IS NOT NULL OR retry_count > 0))) {} \
             ORDER BY retry_at ASC NULLS FIRST, id ASC LIMIT ?",
            clause
        );
        let mut query = sqlx::query_as::<_, Registry>(&sql)
            .bind(SyncState::Failed.as_i16())
            .bind(now_ms())
            .bind(SyncState::Pending.as_i16());
        for id in except_ids {
            query = query.bind(id);
        }
        let rows = query.bind(batch_size as i64).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    // =========================================================================
    // Verification claim queries
    // =========================================================================

    /// Claim up to `batch_size` synced rows awaiting their first verification:
    /// atomically flips them to `verification_started` and returns them.
    /// Ordered by `verified_at` with NULLs first, so never-verified rows go
    /// ahead of re-verifications.
    pub async fn verification_pending_batch(&self, batch_size: u32) -> Result<Vec<Registry>> {
        check_batch_size(batch_size)?;
        self.claim_verification_batch(
            "verification_pending_batch",
            VerificationState::Pending,
            "SELECT id FROM registries \
             WHERE state = ? AND verification_state = ? \
             ORDER BY verified_at ASC NULLS FIRST LIMIT ?",
            None,
            batch_size,
        )
        .await
    }

    /// Claim up to `batch_size` synced rows whose verification failed and
    /// whose retry backoff has elapsed. Ordered by `verification_retry_at`
    /// with NULLs first.
    pub async fn verification_failed_batch(&self, batch_size: u32) -> Result<Vec<Registry>> {
        check_batch_size(batch_size)?;
        self.claim_verification_batch(
            "verification_failed_batch",
            VerificationState::Failed,
            "SELECT id FROM registries \
             WHERE state = ? AND verification_state = ? \
               AND (verification_retry_at IS NULL OR verification_retry_at <= ?) \
             ORDER BY verification_retry_at ASC NULLS FIRST LIMIT ?",
            Some(now_ms()),
            batch_size,
        )
        .await
    }

    /// The shared select-and-flip. A single UPDATE with a subquery keeps the
    /// claim atomic under concurrent callers.
    async fn claim_verification_batch(
        &self,
        method: &str,
        from: VerificationState,
        subquery: &str,
        due_cutoff: Option<i64>,
        batch_size: u32,
    ) -> Result<Vec<Registry>> {
        let started = Instant::now();
        let now = now_ms();
        let sql = format!(
            "UPDATE registries SET verification_state = ?, verification_started_at = ? \
             WHERE id IN ({}) RETURNING *",
            subquery
        );

        let pool = &self.pool;
        let rows = execute_with_retry(method, || {
            let sql = sql.clone();
            async move {
                let mut query = sqlx::query_as::<_, Registry>(&sql)
                    .bind(VerificationState::Started.as_i16())
                    .bind(now)
                    .bind(SyncState::Synced.as_i16())
                    .bind(from.as_i16());
                if let Some(cutoff) = due_cutoff {
                    query = query.bind(cutoff);
                }
                query.bind(batch_size as i64).fetch_all(pool).await
            }
        })
        .await?;

        if !rows.is_empty() {
            let ids: Vec<String> = rows.iter().map(|r| r.id.to_string()).collect();
            debug!(
                table = "registries",
                ids = %ids.join(","),
                count = rows.len(),
                from = %from,
                to = %VerificationState::Started,
                method,
                "Batch verification state transition"
            );
        }
        crate::metrics::record_batch_claim(method, rows.len(), started.elapsed());

        Ok(rows)
    }

    // =========================================================================
    // Verification backlog accounting
    // =========================================================================

    /// Count of rows due for verification (pending, or failed with elapsed
    /// backoff), bounded by `limit` for cheap dashboarding.
    pub async fn needs_verification_count(&self, limit: u32) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ( \
                 SELECT 1 FROM registries \
                 WHERE state = ? \
                   AND (verification_state = ? \
                        OR (verification_state = ? \
                            AND (verification_retry_at IS NULL OR verification_retry_at <= ?))) \
                 LIMIT ?)",
        )
        .bind(SyncState::Synced.as_i16())
        .bind(VerificationState::Pending.as_i16())
        .bind(VerificationState::Failed.as_i16())
        .bind(now_ms())
        .bind(limit as i64)
        .fetch_one(&self.pool)
        .await?;

        crate::metrics::record_needs_verification(count);
        Ok(count)
    }

    /// Flip up to `batch_size` long-verified rows back to
    /// `verification_pending` so their content gets re-checked. Returns the
    /// number of rows flipped.
    pub async fn reverify_batch(&self, batch_size: u32) -> Result<u64> {
        check_batch_size(batch_size)?;
        let cutoff = now_ms() - self.config.reverification_interval().as_millis() as i64;
        let pool = &self.pool;

        let result = execute_with_retry("reverify_batch", || async move {
            sqlx::query(
                "UPDATE registries SET verification_state = ? \
                 WHERE id IN ( \
                     SELECT id FROM registries \
                     WHERE state = ? AND verification_state = ? AND verified_at <= ? \
                     ORDER BY verified_at ASC LIMIT ?)",
            )
            .bind(VerificationState::Pending.as_i16())
            .bind(SyncState::Synced.as_i16())
            .bind(VerificationState::Succeeded.as_i16())
            .bind(cutoff)
            .bind(batch_size as i64)
            .execute(pool)
            .await
        })
        .await?;

        let flipped = result.rows_affected();
        if flipped > 0 {
            debug!(count = flipped, "Scheduled rows for re-verification");
        }
        Ok(flipped)
    }

    // =========================================================================
    // Timeout reapers
    // =========================================================================

    /// Force `started` rows with a stale claim back to `failed` so the retry
    /// machinery applies. Returns the number of rows recovered.
    ///
    /// Bulk backoff note: `retry_at` is computed in SQL without jitter; the
    /// polynomial term dominates for rows that keep timing out.
    pub async fn fail_sync_timeouts(&self) -> Result<u64> {
        let timeout = self.config.sync_timeout();
        let cutoff = now_ms() - timeout.as_millis() as i64;
        let message = truncate_message(&format!(
            "Sync timed out after {}s",
            timeout.as_secs()
        ));
        let pool = &self.pool;
        let now = now_ms();
        let cap_ms = crate::backoff::RETRY_CAP.as_millis() as i64;

        let result = execute_with_retry("fail_sync_timeouts", || {
            let message = message.clone();
            async move {
                sqlx::query(
                    "UPDATE registries SET \
                         state = ?, \
                         last_sync_failure = ?, \
                         retry_count = retry_count + 1, \
                         retry_at = ? + MIN(?, \
                             ((retry_count + 1) * (retry_count + 1) * (retry_count + 1) * (retry_count + 1) + 15) * 1000) \
                     WHERE state = ? AND (last_synced_at IS NULL OR last_synced_at <= ?)",
                )
                .bind(SyncState::Failed.as_i16())
                .bind(&message)
                .bind(now)
                .bind(cap_ms)
                .bind(SyncState::Started.as_i16())
                .bind(cutoff)
                .execute(pool)
                .await
            }
        })
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(count = recovered, "Forced timed-out syncs to failed");
            crate::metrics::record_timeout_recovery("sync", recovered);
        }
        Ok(recovered)
    }

    /// Force rows stuck in `verification_started` back into the retry path.
    /// Both sides are reset: verification to `verification_failed` and sync
    /// to `failed`, so the content is re-transferred before the next check.
    pub async fn fail_verification_timeouts(&self) -> Result<u64> {
        let timeout = self.config.verification_timeout();
        let cutoff = now_ms() - timeout.as_millis() as i64;
        let message = truncate_message(&format!(
            "Verification timed out after {}s",
            timeout.as_secs()
        ));
        let pool = &self.pool;
        let now = now_ms();
        let cap_ms = crate::backoff::RETRY_CAP.as_millis() as i64;

        let result = execute_with_retry("fail_verification_timeouts", || {
            let message = message.clone();
            async move {
                sqlx::query(
                    "UPDATE registries SET \
                         verification_state = ?, \
                         verification_failure = ?, \
                         verification_checksum = NULL, \
                         verification_retry_count = verification_retry_count + 1, \
                         verification_retry_at = ? + MIN(?, \
                             ((verification_retry_count + 1) * (verification_retry_count + 1) * (verification_retry_count + 1) * (verification_retry_count + 1) + 15) * 1000), \
                         state = ?, \
                         last_sync_failure = ?, \
                         retry_count = retry_count + 1, \
                         retry_at = ? + MIN(?, \
                             ((retry_count + 1) * (retry_count + 1) * (retry_count + 1) * (retry_count + 1) + 15) * 1000) \
                     WHERE verification_state = ? \
                       AND (verification_started_at IS NULL OR verification_started_at <= ?)",
                )
                .bind(VerificationState::Failed.as_i16())
                .bind(&message)
                .bind(now)
                .bind(cap_ms)
                .bind(SyncState::Failed.as_i16())
                .bind(&message)
                .bind(now)
                .bind(cap_ms)
                .bind(VerificationState::Started.as_i16())
                .bind(cutoff)
                .execute(pool)
                .await
            }
        })
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(count = recovered, "Forced timed-out verifications to failed");
            crate::metrics::record_timeout_recovery("verification", recovered);
        }
        Ok(recovered)
    }
}

/// The destination side of the batch cursor: the registry table's
/// `model_record_id` column.
impl IdTable for RegistryStore {
    fn min_id(&self) -> BoxFuture<'_, Result<Option<i64>>> {
        Box::pin(async move {
            let (min,): (Option<i64>,) =
                sqlx::query_as("SELECT MIN(model_record_id) FROM registries")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(min)
        })
    }

    fn batch_end(&self, from: i64, batch_size: u32) -> BoxFuture<'_, Result<(Option<i64>, bool)>> {
        Box::pin(async move {
            // Fetch batch_size + 1 to learn whether rows exist beyond
            let rows: Vec<(i64,)> = sqlx::query_as(
                "SELECT model_record_id FROM registries WHERE model_record_id >= ? \
                 ORDER BY model_record_id ASC LIMIT ?",
            )
            .bind(from)
            .bind(batch_size as i64 + 1)
            .fetch_all(&self.pool)
            .await?;

            let more = rows.len() > batch_size as usize;
            let end = rows
                .iter()
                .take(batch_size as usize)
                .last()
                .map(|(id,)| *id);
            Ok((end, more))
        })
    }
}

fn check_batch_size(batch_size: u32) -> Result<()> {
    if batch_size == 0 {
        return Err(EngineError::InvalidArgument(
            "batch_size must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Build an `AND <column> NOT IN (?, ...)` clause for `ids`, or an empty
/// string when there is nothing to exclude. Returns the clause and the number
/// of placeholders.
fn not_in_clause(column: &str, ids: &[i64]) -> (String, usize) {
    if ids.is_empty() {
        return (String::new(), 0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    (format!("AND {} NOT IN ({})", column, placeholders), ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (RegistryStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("registries.db"), EngineConfig::for_testing())
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_ensure_creates_row_once() {
        let (store, _dir) = test_store().await;

        let first = store.ensure(42).await.unwrap();
        assert_eq!(first.model_record_id, 42);
        assert_eq!(first.sync_state(), SyncState::Pending);
        assert_eq!(first.verify_state(), VerificationState::Disabled);
        assert!(first.brand_new_pending());

        let second = store.ensure(42).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_by_model_record_id_missing() {
        let (store, _dir) = test_store().await;
        assert!(store.get_by_model_record_id(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_by_state() {
        let (store, _dir) = test_store().await;
        store.ensure(1).await.unwrap();
        store.ensure(2).await.unwrap();

        assert_eq!(store.count_by_state(SyncState::Pending).await.unwrap(), 2);
        assert_eq!(store.count_by_state(SyncState::Synced).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ordered_by_id_and_not_pending() {
        let (store, _dir) = test_store().await;
        store.ensure(30).await.unwrap();
        store.ensure(10).await.unwrap();
        store.ensure(20).await.unwrap();

        let rows = store.ordered_by_id().await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        // All rows are pending, so not_pending is empty
        assert!(store.not_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordered_by_variants_run() {
        let (store, _dir) = test_store().await;
        store.ensure(1).await.unwrap();

        for order in [
            SortOrder::IdAsc,
            SortOrder::IdDesc,
            SortOrder::LastSyncedAtAsc,
            SortOrder::LastSyncedAtDesc,
            SortOrder::RetryAtAsc,
            SortOrder::VerifiedAtAsc,
        ] {
            assert_eq!(store.ordered_by(order).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_claim_batch_size_zero_fails_fast() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.verification_pending_batch(0).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.verification_failed_batch(0).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.find_registries_never_attempted_sync(0, &[]).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_never_attempted_sync_excludes_ids() {
        let (store, _dir) = test_store().await;
        let a = store.ensure(1).await.unwrap();
        let b = store.ensure(2).await.unwrap();

        let found = store
            .find_registries_never_attempted_sync(10, &[a.id])
            .await
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[tokio::test]
    async fn test_not_in_clause_shapes() {
        assert_eq!(not_in_clause("id", &[]), (String::new(), 0));
        let (clause, n) = not_in_clause("id", &[1, 2, 3]);
        assert_eq!(clause, "AND id NOT IN (?, ?, ?)");
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_id_table_over_model_record_ids() {
        let (store, _dir) = test_store().await;
        store.ensure(5).await.unwrap();
        store.ensure(9).await.unwrap();
        store.ensure(12).await.unwrap();

        assert_eq!(store.min_id().await.unwrap(), Some(5));
        assert_eq!(store.batch_end(5, 2).await.unwrap(), (Some(9), true));
        assert_eq!(store.batch_end(10, 2).await.unwrap(), (Some(12), false));
        assert_eq!(store.batch_end(13, 2).await.unwrap(), (None, false));
    }

    #[tokio::test]
    async fn test_is_sqlite_busy_error_classification() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempt_count += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempt_count += 1;
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        assert!(result.is_err());
        // Non-busy errors should not retry
        assert_eq!(attempt_count, 1);
    }
}
