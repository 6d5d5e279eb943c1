// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication batching and verification engine.
//!
//! Tracks, on a secondary site, the replication and verification lifecycle of
//! records owned by a primary site. One registry row exists per replicable
//! record; two state machines run over each row (sync and verification), and
//! a cursor-based batcher walks the id space so background schedulers can
//! work the backlog in bounded slices.
//!
//! ```text
//!                        ┌─────────────────┐
//!     source id table ──▶│     Batcher     │──▶ id ranges
//!   registry id table ──▶│  (next_range)   │
//!                        └────────┬────────┘
//!                                 │ cursor
//!                        ┌────────▼────────┐
//!                        │   CursorCache   │  (Redis or in-memory,
//!                        └─────────────────┘   loss-tolerant)
//!
//!                        ┌─────────────────┐
//!        id range ──────▶│  RegistryStore  │──▶ registry rows (SQLite)
//!                        │                 │
//!   sync workers ───────▶│ start_sync      │   pending → started
//!                        │ mark_synced     │   started → synced
//!                        │ mark_failed     │   * → failed (+ backoff)
//!                        │ mark_pending    │   terminal → pending
//!                        │                 │
//!   verify workers ─────▶│ *_batch claims  │   atomic claim + start
//!                        │ track_checksum_ │   succeeded / failed /
//!                        │   attempt       │   mismatch bookkeeping
//!                        └─────────────────┘
//! ```
//!
//! The engine is storage-facing only: actually transferring content and
//! computing checksums belong to the caller, plugged in through the
//! [`Replicator`] trait and the checksum closure of
//! [`track_checksum_attempt`](store::RegistryStore::track_checksum_attempt).
//!
//! # Durability Model
//!
//! Registry rows are the durable source of truth (SQLite, WAL). The batch
//! cursor lives in a cache and may vanish at any time; losing it restarts the
//! scan from the beginning, which re-covers ids but never skips them.
//! Downstream operations are idempotent, so double-processing an id is wasted
//! work rather than corruption.

pub mod backoff;
pub mod cache;
pub mod config;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod replicator;
pub mod store;

mod sync;
mod verification;

pub use cache::{CursorCache, MemoryCursorCache, RedisCursorCache};
pub use config::EngineConfig;
pub use cursor::{Batcher, IdTable, MemoryIdTable};
pub use error::{EngineError, Result};
pub use registry::{Registry, SyncState, VerificationState, MAX_FAILURE_MESSAGE_LEN};
pub use replicator::{Replicator, StaticReplicator};
pub use store::{RegistryStore, SortOrder};
pub use verification::CHECKSUM_MISMATCH_MESSAGE;
