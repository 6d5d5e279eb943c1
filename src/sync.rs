// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync state machine transitions.
//!
//! The sync machine moves a registry row through
//! `pending → started → synced | failed`, with `mark_pending` cycling
//! terminal rows back for a resync. Every transition is a single guarded
//! UPDATE, so a stale caller loses the race instead of clobbering newer
//! state.
//!
//! The verification machine rides along: a row's verification state only
//! means something while the row is synced, so sync transitions park
//! verification in `verification_disabled` whenever the row leaves `synced`.
//! The one exception is a sync failure caused by verification itself, which
//! keeps `verification_failed` so the verification retry schedule survives
//! the re-transfer.

use crate::backoff;
use crate::error::Result;
use crate::registry::{failure_message, Registry, SyncState, VerificationState};
use crate::replicator::Replicator;
use crate::store::{execute_with_retry, now_ms, RegistryStore};
use tracing::{debug, warn};

impl RegistryStore {
    /// Claim a row for syncing: `pending` or `failed` becomes `started`.
    ///
    /// Returns `false` when the row was not in a claimable state, which is
    /// how a concurrent claimer learns it lost the race. `last_synced_at` is
    /// stamped on claim so the timeout reaper can spot abandoned attempts.
    pub async fn start_sync(&self, registry: &mut Registry) -> Result<bool> {
        let pool = self.pool();
        let id = registry.id;
        let now = now_ms();

        let result = execute_with_retry("start_sync", || async move {
            sqlx::query(
                "UPDATE registries SET state = ?, last_synced_at = ? \
                 WHERE id = ? AND state IN (?, ?)",
            )
            .bind(SyncState::Started.as_i16())
            .bind(now)
            .bind(id)
            .bind(SyncState::Pending.as_i16())
            .bind(SyncState::Failed.as_i16())
            .execute(pool)
            .await
        })
        .await?;

        let claimed = result.rows_affected() > 0;
        if claimed {
            self.log_sync_transition(registry, SyncState::Started);
        } else {
            debug!(
                registry_id = id,
                state = %registry.sync_state(),
                "Sync claim lost, row not pending or failed"
            );
        }
        self.reload(registry).await?;
        Ok(claimed)
    }

    /// Record a successful sync.
    ///
    /// Guarded against clobbering: only a row still in `started` moves to
    /// `synced`, so a reaper that already failed the row wins. On success the
    /// retry bookkeeping is cleared and verification is kicked off - to
    /// `verification_pending` when the replicator allows it, otherwise
    /// `verification_disabled`.
    pub async fn mark_synced(
        &self,
        registry: &mut Registry,
        replicator: &dyn Replicator,
    ) -> Result<bool> {
        let pool = self.pool();
        let id = registry.id;
        let now = now_ms();
        let verification_target = if replicator.ready_to_verify() {
            VerificationState::Pending
        } else {
            VerificationState::Disabled
        };

        let result = execute_with_retry("mark_synced", || async move {
            sqlx::query(
                "UPDATE registries SET \
                     state = ?, \
                     retry_count = 0, \
                     retry_at = NULL, \
                     last_sync_failure = NULL, \
                     last_synced_at = ?, \
                     verification_state = ? \
                 WHERE id = ? AND state = ?",
            )
            .bind(SyncState::Synced.as_i16())
            .bind(now)
            .bind(verification_target.as_i16())
            .bind(id)
            .bind(SyncState::Started.as_i16())
            .execute(pool)
            .await
        })
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            self.log_sync_transition(registry, SyncState::Synced);
        } else {
            debug!(
                registry_id = id,
                "Sync success ignored, row no longer started"
            );
        }
        self.reload(registry).await?;
        Ok(applied)
    }

    /// Record a failed sync attempt.
    ///
    /// Composes and truncates the failure message, bumps the retry counter
    /// and schedules the next attempt with capped backoff (four hours instead
    /// of one when the record is missing on the primary). Verification is
    /// parked in `verification_disabled` unless it is already
    /// `verification_failed`, in which case its own retry schedule is kept.
    pub async fn mark_failed(
        &self,
        registry: &mut Registry,
        message: &str,
        error: Option<&str>,
        missing_on_primary: bool,
    ) -> Result<()> {
        let pool = self.pool();
        let id = registry.id;
        let failure = failure_message(message, error);
        let retry_count = registry.retry_count + 1;
        let retry_at = backoff::next_sync_retry_at(retry_count, missing_on_primary);

        execute_with_retry("mark_failed", || {
            let failure = failure.clone();
            async move {
                sqlx::query(
                    "UPDATE registries SET \
                         state = ?, \
                         last_sync_failure = ?, \
                         retry_count = ?, \
                         retry_at = ?, \
                         verification_state = CASE WHEN verification_state = ? \
                             THEN verification_state ELSE ? END \
                     WHERE id = ?",
                )
                .bind(SyncState::Failed.as_i16())
                .bind(&failure)
                .bind(retry_count)
                .bind(retry_at.timestamp_millis())
                .bind(VerificationState::Failed.as_i16())
                .bind(VerificationState::Disabled.as_i16())
                .bind(id)
                .execute(pool)
                .await
            }
        })
        .await?;

        warn!(
            registry_id = id,
            model_record_id = registry.model_record_id,
            failure = %failure,
            retry_count,
            missing_on_primary,
            "Sync failed"
        );
        crate::metrics::record_sync_transition("failed");
        self.reload(registry).await?;
        Ok(())
    }

    /// Request a resync: a terminal row (`synced` or `failed`) goes back to
    /// `pending` with its retry bookkeeping cleared, and verification is
    /// disabled until the new transfer lands. `last_synced_at` is cleared
    /// too, but the row is still distinguishable from a brand new one by its
    /// verification history.
    pub async fn mark_pending(&self, registry: &mut Registry) -> Result<bool> {
        let pool = self.pool();
        let id = registry.id;

        let result = execute_with_retry("mark_pending", || async move {
            sqlx::query(
                "UPDATE registries SET \
                     state = ?, \
                     retry_count = 0, \
                     retry_at = NULL, \
                     last_sync_failure = NULL, \
                     last_synced_at = NULL, \
                     verification_state = ? \
                 WHERE id = ? AND state IN (?, ?)",
            )
            .bind(SyncState::Pending.as_i16())
            .bind(VerificationState::Disabled.as_i16())
            .bind(id)
            .bind(SyncState::Synced.as_i16())
            .bind(SyncState::Failed.as_i16())
            .execute(pool)
            .await
        })
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            self.log_sync_transition(registry, SyncState::Pending);
        } else {
            debug!(
                registry_id = id,
                state = %registry.sync_state(),
                "Resync request ignored, row not in a terminal state"
            );
        }
        self.reload(registry).await?;
        Ok(applied)
    }

    fn log_sync_transition(&self, registry: &Registry, to: SyncState) {
        debug!(
            registry_id = registry.id,
            model_record_id = registry.model_record_id,
            from = %registry.sync_state(),
            to = %to,
            "Sync state transition"
        );
        crate::metrics::record_sync_transition(match to {
            SyncState::Pending => "pending",
            SyncState::Started => "started",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        });
    }
}
