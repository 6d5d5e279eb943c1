//! Configuration for the registry engine.
//!
//! All tunables live in [`EngineConfig`], which can be constructed
//! programmatically or deserialized from YAML/JSON. Every field has a serde
//! default so partial configs work.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_registry::config::EngineConfig;
//!
//! let config = EngineConfig {
//!     batch_size: 500,
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── batch_size: u32                  # default range/claim size
//! ├── sync_timeout_secs: u64           # started rows older than this are stale
//! ├── verification_timeout_secs: u64   # verification_started rows older than this are stale
//! ├── reverification_interval_secs: u64 # succeeded rows older than this are re-checked
//! └── cursor_key_prefix: String        # namespace for cursor cache keys
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_batch_size() -> u32 {
    1000
}

fn default_sync_timeout_secs() -> u64 {
    8 * 60 * 60
}

fn default_verification_timeout_secs() -> u64 {
    8 * 60 * 60
}

fn default_reverification_interval_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_cursor_key_prefix() -> String {
    "registry:batcher".to_string()
}

/// Tunable parameters for the batching and verification engine.
///
/// The timeouts govern the external reaper operations
/// ([`fail_sync_timeouts`](crate::store::RegistryStore::fail_sync_timeouts),
/// [`fail_verification_timeouts`](crate::store::RegistryStore::fail_verification_timeouts)):
/// a claimed-but-abandoned row older than the timeout is forced back to a
/// failed state so the normal retry machinery applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default number of ids per cursor range and rows per claim batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// A `started` row whose `last_synced_at` is older than this is considered
    /// abandoned (worker died mid-sync).
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,

    /// A `verification_started` row whose `verification_started_at` is older
    /// than this is considered abandoned (worker died mid-checksum).
    #[serde(default = "default_verification_timeout_secs")]
    pub verification_timeout_secs: u64,

    /// A `verification_succeeded` row whose `verified_at` is older than this
    /// becomes eligible for re-verification.
    #[serde(default = "default_reverification_interval_secs")]
    pub reverification_interval_secs: u64,

    /// Namespace prefix for cursor cache keys, so multiple record types can
    /// share one cache backend without colliding.
    #[serde(default = "default_cursor_key_prefix")]
    pub cursor_key_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sync_timeout_secs: default_sync_timeout_secs(),
            verification_timeout_secs: default_verification_timeout_secs(),
            reverification_interval_secs: default_reverification_interval_secs(),
            cursor_key_prefix: default_cursor_key_prefix(),
        }
    }
}

impl EngineConfig {
    /// Small batches and short timeouts for fast tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            sync_timeout_secs: 2,
            verification_timeout_secs: 2,
            reverification_interval_secs: 2,
            cursor_key_prefix: "test:batcher".to_string(),
        }
    }

    /// Sync staleness threshold as a [`Duration`].
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Verification staleness threshold as a [`Duration`].
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    /// Re-verification interval as a [`Duration`].
    pub fn reverification_interval(&self) -> Duration {
        Duration::from_secs(self.reverification_interval_secs)
    }
}
