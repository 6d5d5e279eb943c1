// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capability interface supplied per record type.
//!
//! The engine is one generic state machine; everything that varies per
//! replicable record type - whether verification is allowed at all, and what
//! the primary site says the content digest should be - comes in through this
//! trait. Concrete record types implement it once instead of duplicating the
//! state machine.

/// What the engine needs to know about a record type / record pair.
///
/// Implementations are expected to be cheap accessors over already-fetched
/// state: nothing here should perform network I/O.
pub trait Replicator: Send + Sync {
    /// Whether this record may be verified at all (feature/licensing gate).
    ///
    /// When `false`, the verification machine parks the row in
    /// `verification_disabled` instead of `verification_pending`.
    fn ready_to_verify(&self) -> bool {
        true
    }

    /// Whether the primary site has a checksum of its own to compare against.
    ///
    /// When `false`, a locally computed checksum is stored and the row is
    /// marked succeeded without comparison.
    fn primary_verification_succeeded(&self) -> bool;

    /// The primary site's checksum, if known.
    fn primary_checksum(&self) -> Option<String>;

    /// Compare a locally computed checksum against the primary's.
    fn matches_checksum(&self, checksum: &str) -> bool {
        self.primary_checksum().as_deref() == Some(checksum)
    }
}

/// Fixed-value [`Replicator`] for tests and standalone use.
#[derive(Debug, Clone, Default)]
pub struct StaticReplicator {
    ready: bool,
    primary_checksum: Option<String>,
}

impl StaticReplicator {
    /// Ready to verify, no primary checksum available.
    pub fn ready() -> Self {
        Self {
            ready: true,
            primary_checksum: None,
        }
    }

    /// Not ready to verify (gated).
    pub fn gated() -> Self {
        Self {
            ready: false,
            primary_checksum: None,
        }
    }

    /// Ready to verify with a known primary checksum.
    pub fn with_primary_checksum(checksum: impl Into<String>) -> Self {
        Self {
            ready: true,
            primary_checksum: Some(checksum.into()),
        }
    }
}

impl Replicator for StaticReplicator {
    fn ready_to_verify(&self) -> bool {
        self.ready
    }

    fn primary_verification_succeeded(&self) -> bool {
        self.primary_checksum.is_some()
    }

    fn primary_checksum(&self) -> Option<String> {
        self.primary_checksum.clone()
    }
}
