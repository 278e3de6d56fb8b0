// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable event-sourced storage for the Session Store (§4.A) and the
//! Progress Tracker (§4.B).
//!
//! State is derived from a JSONL write-ahead log (`wal`), periodically
//! compacted into a compressed `snapshot` by the background `checkpoint`
//! writer. `migration` carries old snapshots forward across schema changes.
//! `state` holds the in-memory `MaterializedState` and the `SessionStore`
//! facade that the rest of the supervisor talks to. `progress` is the
//! separate, append-friendly journal used for per-iteration progress
//! updates, which does not go through the WAL.

mod checkpoint;
mod migration;
mod progress;
mod snapshot;
mod state;
mod wal;

pub use checkpoint::{
    load_snapshot, CheckpointError, CheckpointHandle, CheckpointResult, CheckpointWriter,
    Checkpointer, FsCheckpointWriter,
};
pub use migration::{Migration, MigrationError, MigrationRegistry};
pub use progress::{ProgressError, ProgressTracker};
pub use snapshot::{Snapshot, SnapshotError};
pub use state::{MaterializedState, SessionStore, StoreError};
pub use wal::{Wal, WalEntry, WalError};

/// Current on-disk snapshot schema version. Bump this and register a
/// [`Migration`] whenever `MaterializedState`'s shape changes.
pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;
