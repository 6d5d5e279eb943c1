// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry rows and their state enums.
//!
//! A [`Registry`] is the per-record bookkeeping row on a secondary site: one
//! per replicable record, created lazily when the record is first discovered,
//! never hard-deleted by this engine. The `model_record_id` is a weak
//! back-reference - the source record may live in different storage and may
//! no longer exist (orphan), so no referential integrity is assumed.
//!
//! Two state machines run over a row:
//!
//! ```text
//! sync:          pending → started → synced
//!                   ▲        │  ▲      │
//!                   │        ▼  │      ▼  (resync requested)
//!                   └────── failed ◄── pending
//!
//! verification:  pending → started → succeeded
//!                   ▲        │            │ (reverify)
//!                   │        ▼            ▼
//!                   └────── failed     pending
//!                (disabled whenever the row is not ready to verify)
//! ```
//!
//! States are persisted as integers; the enums here are the only place that
//! mapping lives.

use std::fmt;

/// Failure messages are truncated to this many characters before persisting.
pub const MAX_FAILURE_MESSAGE_LEN: usize = 255;

/// Sync lifecycle of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Pending,
    Started,
    Synced,
    Failed,
}

impl SyncState {
    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Pending => 0,
            Self::Started => 1,
            Self::Synced => 2,
            Self::Failed => 3,
        }
    }

    pub const fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Started),
            2 => Some(Self::Synced),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Synced => "synced",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Verification lifecycle of a registry row.
///
/// `Disabled` is a terminal side-state: it is entered instead of `Pending`
/// whenever the row is judged not ready to verify (feature gate, or the sync
/// state is not `synced` - verifying data that is not confirmed present is
/// meaningless).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationState {
    Pending,
    Started,
    Succeeded,
    Failed,
    Disabled,
}

impl VerificationState {
    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Pending => 0,
            Self::Started => 1,
            Self::Succeeded => 2,
            Self::Failed => 3,
            Self::Disabled => 4,
        }
    }

    pub const fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Started),
            2 => Some(Self::Succeeded),
            3 => Some(Self::Failed),
            4 => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "verification_pending",
            Self::Started => "verification_started",
            Self::Succeeded => "verification_succeeded",
            Self::Failed => "verification_failed",
            Self::Disabled => "verification_disabled",
        };
        write!(f, "{}", s)
    }
}

/// One registry row. Timestamps are UTC milliseconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Registry {
    pub id: i64,
    /// Weak back-reference to the source record (no FK constraint; orphans
    /// are possible and expected).
    pub model_record_id: i64,
    pub state: i16,
    pub retry_count: i32,
    pub retry_at: Option<i64>,
    pub last_sync_failure: Option<String>,
    pub last_synced_at: Option<i64>,
    pub verification_state: i16,
    /// Locally computed digest of the record's content.
    pub verification_checksum: Option<String>,
    /// The primary's checksum, stored only on mismatch.
    pub verification_checksum_mismatched: Option<String>,
    /// Cleared on a later verification success.
    pub checksum_mismatch: bool,
    pub verification_retry_count: i32,
    pub verification_retry_at: Option<i64>,
    pub verification_failure: Option<String>,
    pub verification_started_at: Option<i64>,
    pub verified_at: Option<i64>,
    pub created_at: i64,
}

impl Registry {
    /// Typed sync state. Unknown stored values read as `Pending`.
    pub fn sync_state(&self) -> SyncState {
        SyncState::from_i16(self.state).unwrap_or(SyncState::Pending)
    }

    /// Typed verification state. Unknown stored values read as `Disabled`.
    pub fn verify_state(&self) -> VerificationState {
        VerificationState::from_i16(self.verification_state).unwrap_or(VerificationState::Disabled)
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state() == SyncState::Pending
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state() == SyncState::Synced
    }

    pub fn is_failed(&self) -> bool {
        self.sync_state() == SyncState::Failed
    }

    pub fn is_verification_succeeded(&self) -> bool {
        self.verify_state() == VerificationState::Succeeded
    }

    pub fn is_verification_failed(&self) -> bool {
        self.verify_state() == VerificationState::Failed
    }

    /// A row that has never synced, never verified and never failed - every
    /// field still at its default. Distinguishes a cold sync candidate from
    /// one that cycled back to pending after prior activity (warm resync).
    pub fn brand_new_pending(&self) -> bool {
        matches!(self.sync_state(), SyncState::Pending | SyncState::Started)
            && self.retry_count == 0
            && self.retry_at.is_none()
            && self.last_sync_failure.is_none()
            && self.last_synced_at.is_none()
            && self.verify_state() == VerificationState::Disabled
            && self.verification_checksum.is_none()
            && self.verification_checksum_mismatched.is_none()
            && !self.checksum_mismatch
            && self.verification_retry_count == 0
            && self.verification_retry_at.is_none()
            && self.verification_failure.is_none()
            && self.verification_started_at.is_none()
            && self.verified_at.is_none()
    }
}

/// Truncate a failure message to [`MAX_FAILURE_MESSAGE_LEN`] characters,
/// eliding with `...` when it does not fit. Character-based, so multi-byte
/// input cannot be split mid-codepoint.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_FAILURE_MESSAGE_LEN {
        return message.to_string();
    }

    let kept: String = message.chars().take(MAX_FAILURE_MESSAGE_LEN - 3).collect();
    format!("{}...", kept)
}

/// Compose `"<message>: <error>"` when an error is present, then truncate.
pub fn failure_message(message: &str, error: Option<&str>) -> String {
    match error {
        Some(error) => truncate_message(&format!("{}: {}", message, error)),
        None => truncate_message(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_registry() -> Registry {
        Registry {
            id: 1,
            model_record_id: 10,
            state: SyncState::Pending.as_i16(),
            retry_count: 0,
            retry_at: None,
            last_sync_failure: None,
            last_synced_at: None,
            verification_state: VerificationState::Disabled.as_i16(),
            verification_checksum: None,
            verification_checksum_mismatched: None,
            checksum_mismatch: false,
            verification_retry_count: 0,
            verification_retry_at: None,
            verification_failure: None,
            verification_started_at: None,
            verified_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_sync_state_roundtrip() {
        for state in [
            SyncState::Pending,
            SyncState::Started,
            SyncState::Synced,
            SyncState::Failed,
        ] {
            assert_eq!(SyncState::from_i16(state.as_i16()), Some(state));
        }
        assert_eq!(SyncState::from_i16(99), None);
    }

    #[test]
    fn test_verification_state_roundtrip() {
        for state in [
            VerificationState::Pending,
            VerificationState::Started,
            VerificationState::Succeeded,
            VerificationState::Failed,
            VerificationState::Disabled,
        ] {
            assert_eq!(VerificationState::from_i16(state.as_i16()), Some(state));
        }
        assert_eq!(VerificationState::from_i16(-1), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SyncState::Synced.to_string(), "synced");
        assert_eq!(
            VerificationState::Pending.to_string(),
            "verification_pending"
        );
        assert_eq!(
            VerificationState::Disabled.to_string(),
            "verification_disabled"
        );
    }

    #[test]
    fn test_truncate_message_short_passthrough() {
        assert_eq!(truncate_message("short"), "short");
        let exact = "x".repeat(255);
        assert_eq!(truncate_message(&exact), exact);
    }

    #[test]
    fn test_truncate_message_long_elided() {
        let long = "y".repeat(300);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.chars().count(), 255);
        assert!(truncated.ends_with("..."));
        assert!(truncated.starts_with("yyy"));
    }

    #[test]
    fn test_truncate_message_multibyte_safe() {
        let long = "é".repeat(300);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.chars().count(), 255);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_failure_message_appends_error() {
        assert_eq!(
            failure_message("Sync failed", Some("connection refused")),
            "Sync failed: connection refused"
        );
        assert_eq!(failure_message("Sync failed", None), "Sync failed");
    }

    #[test]
    fn test_failure_message_truncates_combined() {
        let message = "m".repeat(200);
        let error = "e".repeat(200);
        let combined = failure_message(&message, Some(&error));
        assert_eq!(combined.chars().count(), 255);
        assert!(combined.ends_with("..."));
    }

    #[test]
    fn test_brand_new_pending_default_row() {
        let registry = blank_registry();
        assert!(registry.brand_new_pending());
    }

    #[test]
    fn test_brand_new_pending_started_row() {
        let mut registry = blank_registry();
        registry.state = SyncState::Started.as_i16();
        assert!(registry.brand_new_pending());
    }

    #[test]
    fn test_brand_new_pending_false_after_activity() {
        let mut synced = blank_registry();
        synced.state = SyncState::Synced.as_i16();
        assert!(!synced.brand_new_pending());

        let mut failed = blank_registry();
        failed.state = SyncState::Failed.as_i16();
        assert!(!failed.brand_new_pending());

        let mut retried = blank_registry();
        retried.retry_count = 1;
        assert!(!retried.brand_new_pending());

        let mut prior_sync = blank_registry();
        prior_sync.last_synced_at = Some(1);
        assert!(!prior_sync.brand_new_pending());

        let mut verified = blank_registry();
        verified.verified_at = Some(1);
        assert!(!verified.brand_new_pending());

        let mut mismatched = blank_registry();
        mismatched.checksum_mismatch = true;
        assert!(!mismatched.brand_new_pending());

        let mut verifying = blank_registry();
        verifying.verification_state = VerificationState::Pending.as_i16();
        assert!(!verifying.brand_new_pending());

        let mut with_failure = blank_registry();
        with_failure.last_sync_failure = Some("foo".to_string());
        assert!(!with_failure.brand_new_pending());
    }
}
