//! Offline-first synchronization engine for MedSync
//!
//! Provides:
//! - Local change tracking with per-entity versions and checksums
//! - Batched upload and single-pass download through a host transport
//! - Checksum-based divergence detection against the last confirmed sync
//! - Conflict resolution (last-write-wins, three-way merge, medication safety)
//! - Pending conflicts held for user decision
//! - Tamper-evident audit trail of every resolution
//! - Pluggable persistence (in-memory or SQLite)

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)
)]

pub mod audit;
pub mod change_tracker;
pub mod config;
pub mod conflict_detection;
pub mod conflict_resolution;
pub mod engine;
pub mod entity;
pub mod error;
pub mod local_db;
pub mod pending_conflicts;
pub mod state_store;
pub mod sync_protocol;
pub mod telemetry;

pub use audit::{AuditEntry, AuditTrail};
pub use change_tracker::{EntitySyncStatus, FailedSync};
pub use config::{SyncConfig, SyncConfigUpdate};
pub use conflict_detection::{ConflictDetector, Divergence};
pub use conflict_resolution::{
    ConflictData, ConflictDiff, ConflictResolver, ConflictType, Resolution, ResolutionStrategy,
};
pub use engine::{ModifiedEntities, SyncEngine, UserChoiceOutcome};
pub use entity::{compute_checksum, SyncEntity};
pub use error::{SyncError, SyncResult};
pub use local_db::{LocalDbConfig, SqliteStateStore};
pub use state_store::{MemoryStateStore, StateStore};
pub use sync_protocol::{SyncReport, SyncTransport};
