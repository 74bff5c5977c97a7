//! Domain layer for the migration ledger
//!
//! # Domain Models
//!
//! - `CheckpointRecord`: one entity's migration attempt and its outcome
//! - `EntitySnapshot`: last-known-good destination state plus checksum
//! - `PolicyDocument`: persisted preservation policy (string-tagged)
//!
//! # Port Traits
//!
//! - `CheckpointStore`: durable progress ledger
//! - `SnapshotStore`: snapshot documents keyed by `(entity_type, entity_id)`
//! - `PolicyStore`: policy documents keyed by entity type
//!
//! # Examples
//!
//! ```rust,ignore
//! use migration_storage::{CheckpointStatus, CheckpointStore, InMemoryStore};
//!
//! async fn example(store: InMemoryStore) -> migration_storage::Result<()> {
//!     store.create("m1", "issue", "E-1", serde_json::json!({})).await?;
//!     store.update("m1", "E-1", CheckpointStatus::Completed, None).await?;
//!
//!     let summary = store.summary("m1").await?;
//!     assert_eq!(summary.completed, 1);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod models;
pub mod ports;

pub use checksum::{canonical_json, checksum, normalize, VolatileFields, DEFAULT_VOLATILE_FIELDS};
pub use models::{
    CheckpointRecord, CheckpointStatus, CheckpointSummary, EntitySnapshot, PolicyDocument,
    SnapshotSource,
};
pub use ports::{CheckpointStore, PolicyStore, SnapshotStore};
