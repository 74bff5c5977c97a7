//! Migration ledger storage
//!
//! Durable state behind the migration resilience layer:
//!
//! 1. **Checkpoints**: one record per `(migration_id, entity_id)` tracking the
//!    current attempt (`pending` → `completed` | `failed`)
//! 2. **Snapshots**: last-known-good destination state with a canonical
//!    checksum, the baseline for detecting manual edits
//! 3. **Policies**: per-entity-type preservation policies stored as
//!    string-tagged documents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use migration_storage::{CheckpointStatus, CheckpointStore, SqliteStore};
//!
//! let store = SqliteStore::open("migration.db")?;
//! store.create("run-1", "issue", "PROJ-1", serde_json::json!({})).await?;
//! store.update("run-1", "PROJ-1", CheckpointStatus::Completed, None).await?;
//!
//! let pending = store.pending("run-1", None).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    canonical_json, checksum, normalize, CheckpointRecord, CheckpointStatus, CheckpointStore,
    CheckpointSummary, EntitySnapshot, PolicyDocument, PolicyStore, SnapshotSource,
    SnapshotStore, VolatileFields, DEFAULT_VOLATILE_FIELDS,
};
pub use infrastructure::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteStore;
