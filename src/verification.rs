// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Verification state machine transitions.
//!
//! Verification confirms that synced content actually matches what the
//! primary site holds: a checksum of the local copy is computed and, when the
//! primary has one of its own, compared against it. Rows move through
//! `verification_pending → verification_started → verification_succeeded |
//! verification_failed`, with `verification_disabled` parking rows that are
//! not eligible.
//!
//! A verification failure is also a sync failure. A bad local copy means the
//! transfer itself must be redone, so the failure paths here push the sync
//! machine to `failed` as well, with a `Verification failed with: ...`
//! message. The sync retry then re-transfers before verification runs again.

use crate::backoff;
use crate::error::Result;
use crate::registry::{truncate_message, Registry, SyncState, VerificationState};
use crate::replicator::Replicator;
use crate::store::{execute_with_retry, now_ms, RegistryStore};
use tracing::{debug, warn};

/// Failure message recorded when the locally computed checksum differs from
/// the primary's.
pub const CHECKSUM_MISMATCH_MESSAGE: &str = "Checksum does not match the primary checksum";

impl RegistryStore {
    /// Mark a row as actively verifying. The batch claim queries do this in
    /// bulk; this is the single-row form for callers holding one registry.
    ///
    /// Guarded on the sync state: only a `synced` row can start verifying,
    /// so a caller racing a resync is a no-op rather than an invariant
    /// breach. Returns whether the transition applied.
    pub async fn verification_started(&self, registry: &mut Registry) -> Result<bool> {
        let pool = self.pool();
        let id = registry.id;
        let now = now_ms();

        let result = execute_with_retry("verification_started", || async move {
            sqlx::query(
                "UPDATE registries SET verification_state = ?, verification_started_at = ? \
                 WHERE id = ? AND state = ?",
            )
            .bind(VerificationState::Started.as_i16())
            .bind(now)
            .bind(id)
            .bind(SyncState::Synced.as_i16())
            .execute(pool)
            .await
        })
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            self.log_verification_transition(registry, VerificationState::Started);
        } else {
            debug!(
                registry_id = id,
                state = %registry.sync_state(),
                "Verification start ignored, row not synced"
            );
        }
        self.reload(registry).await?;
        Ok(applied)
    }

    /// Record a successful verification with the computed checksum. Clears
    /// every failure and mismatch field and stamps `verified_at`.
    pub async fn verification_succeeded_with_checksum(
        &self,
        registry: &mut Registry,
        checksum: &str,
    ) -> Result<()> {
        let pool = self.pool();
        let id = registry.id;
        let now = now_ms();

        execute_with_retry("verification_succeeded", || {
            let checksum = checksum.to_string();
            async move {
                sqlx::query(
                    "UPDATE registries SET \
                         verification_state = ?, \
                         verification_checksum = ?, \
                         verification_checksum_mismatched = NULL, \
                         checksum_mismatch = 0, \
                         verification_retry_count = 0, \
                         verification_retry_at = NULL, \
                         verification_failure = NULL, \
                         verified_at = ? \
                     WHERE id = ?",
                )
                .bind(VerificationState::Succeeded.as_i16())
                .bind(&checksum)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await
            }
        })
        .await?;

        self.log_verification_transition(registry, VerificationState::Succeeded);
        self.reload(registry).await?;
        Ok(())
    }

    /// Record a failed verification attempt, scheduling the retry and failing
    /// the sync side so the content gets re-transferred first.
    pub async fn verification_failed_with_message(
        &self,
        registry: &mut Registry,
        message: &str,
    ) -> Result<()> {
        let failure = truncate_message(message);
        self.apply_verification_failure(registry, &failure, None, false)
            .await
    }

    /// Record a checksum mismatch: the computed checksum is kept, the
    /// primary's is stored alongside for diagnosis, and the row takes the
    /// ordinary verification failure path.
    pub async fn verification_checksum_mismatch(
        &self,
        registry: &mut Registry,
        checksum: &str,
        primary_checksum: Option<&str>,
    ) -> Result<()> {
        crate::metrics::record_checksum_mismatch();
        warn!(
            registry_id = registry.id,
            model_record_id = registry.model_record_id,
            checksum,
            primary_checksum = primary_checksum.unwrap_or(""),
            "Checksum mismatch"
        );
        self.apply_verification_failure(
            registry,
            CHECKSUM_MISMATCH_MESSAGE,
            Some((checksum, primary_checksum)),
            true,
        )
        .await
    }

    /// Park the row's verification. Entered instead of `verification_pending`
    /// whenever the row is not eligible to verify.
    pub async fn verification_disabled(&self, registry: &mut Registry) -> Result<()> {
        let pool = self.pool();
        let id = registry.id;

        execute_with_retry("verification_disabled", || async move {
            sqlx::query("UPDATE registries SET verification_state = ? WHERE id = ?")
                .bind(VerificationState::Disabled.as_i16())
                .bind(id)
                .execute(pool)
                .await
        })
        .await?;

        self.log_verification_transition(registry, VerificationState::Disabled);
        self.reload(registry).await?;
        Ok(())
    }

    /// Queue the row for (re-)verification. The retry bookkeeping is
    /// deliberately left alone: a row forced back to pending after failures
    /// keeps its place in the backoff schedule until an attempt actually
    /// succeeds.
    pub async fn verification_pending(&self, registry: &mut Registry) -> Result<()> {
        let pool = self.pool();
        let id = registry.id;

        execute_with_retry("verification_pending", || async move {
            sqlx::query("UPDATE registries SET verification_state = ? WHERE id = ?")
                .bind(VerificationState::Pending.as_i16())
                .bind(id)
                .execute(pool)
                .await
        })
        .await?;

        self.log_verification_transition(registry, VerificationState::Pending);
        self.reload(registry).await?;
        Ok(())
    }

    /// Run one verification attempt end to end.
    ///
    /// Computes the checksum via `f`, then routes the outcome:
    ///
    /// - not ready to verify (replicator gate, or the row is not synced):
    ///   `verification_disabled`
    /// - checksum computation error: `verification_failed`
    /// - primary has no checksum: store ours, `verification_succeeded`
    /// - checksums match: `verification_succeeded`
    /// - checksums differ: mismatch bookkeeping, `verification_failed`
    pub async fn track_checksum_attempt<F>(
        &self,
        registry: &mut Registry,
        replicator: &dyn Replicator,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>>,
    {
        // Verifying content that is not confirmed present is meaningless, so
        // an unsynced row is parked no matter what the replicator says
        if !replicator.ready_to_verify() || !registry.is_synced() {
            return self.verification_disabled(registry).await;
        }

        // A resync racing in between loses us the start claim; leave the row
        // to the new transfer
        if !self.verification_started(registry).await? {
            return Ok(());
        }

        let checksum = match f() {
            Ok(checksum) => checksum,
            Err(e) => {
                let message =
                    truncate_message(&format!("Error during verification: {}", e));
                return self
                    .verification_failed_with_message(registry, &message)
                    .await;
            }
        };

        if !replicator.primary_verification_succeeded() {
            // Nothing to compare against yet; record ours and succeed
            return self
                .verification_succeeded_with_checksum(registry, &checksum)
                .await;
        }

        if replicator.matches_checksum(&checksum) {
            self.verification_succeeded_with_checksum(registry, &checksum)
                .await
        } else {
            self.verification_checksum_mismatch(
                registry,
                &checksum,
                replicator.primary_checksum().as_deref(),
            )
            .await
        }
    }

    /// The shared failure path. `mismatch` carries the computed and primary
    /// checksums when the failure is a content divergence rather than an
    /// attempt error.
    async fn apply_verification_failure(
        &self,
        registry: &mut Registry,
        failure: &str,
        mismatch: Option<(&str, Option<&str>)>,
        is_mismatch: bool,
    ) -> Result<()> {
        let pool = self.pool();
        let id = registry.id;
        let verification_retry_count = registry.verification_retry_count + 1;
        let verification_retry_at =
            backoff::next_verification_retry_at(verification_retry_count).timestamp_millis();
        let sync_failure = truncate_message(&format!("Verification failed with: {}", failure));
        let sync_retry_count = registry.retry_count + 1;
        let sync_retry_at =
            backoff::next_sync_retry_at(sync_retry_count, false).timestamp_millis();
        let (checksum, primary) = match mismatch {
            Some((checksum, primary)) => (Some(checksum.to_string()), primary.map(String::from)),
            None => (None, None),
        };

        execute_with_retry("verification_failed", || {
            let failure = failure.to_string();
            let sync_failure = sync_failure.clone();
            let checksum = checksum.clone();
            let primary = primary.clone();
            async move {
                sqlx::query(
                    "UPDATE registries SET \
                         verification_state = ?, \
                         verification_failure = ?, \
                         verification_checksum = ?, \
                         verification_checksum_mismatched = ?, \
                         checksum_mismatch = ?, \
                         verification_retry_count = ?, \
                         verification_retry_at = ?, \
                         state = ?, \
                         last_sync_failure = ?, \
                         retry_count = ?, \
                         retry_at = ? \
                     WHERE id = ?",
                )
                .bind(VerificationState::Failed.as_i16())
                .bind(&failure)
                .bind(&checksum)
                .bind(&primary)
                .bind(is_mismatch)
                .bind(verification_retry_count)
                .bind(verification_retry_at)
                .bind(SyncState::Failed.as_i16())
                .bind(&sync_failure)
                .bind(sync_retry_count)
                .bind(sync_retry_at)
                .bind(id)
                .execute(pool)
                .await
            }
        })
        .await?;

        warn!(
            registry_id = id,
            model_record_id = registry.model_record_id,
            failure,
            verification_retry_count,
            "Verification failed"
        );
        self.log_verification_transition(registry, VerificationState::Failed);
        crate::metrics::record_sync_transition("failed");
        self.reload(registry).await?;
        Ok(())
    }

    fn log_verification_transition(&self, registry: &Registry, to: VerificationState) {
        debug!(
            registry_id = registry.id,
            model_record_id = registry.model_record_id,
            from = %registry.verify_state(),
            to = %to,
            "Verification state transition"
        );
        crate::metrics::record_verification_transition(match to {
            VerificationState::Pending => "pending",
            VerificationState::Started => "started",
            VerificationState::Succeeded => "succeeded",
            VerificationState::Failed => "failed",
            VerificationState::Disabled => "disabled",
        });
    }
}
