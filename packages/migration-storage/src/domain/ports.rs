//! Port traits implemented by the storage adapters

use async_trait::async_trait;
use serde_json::Value;

use super::models::{
    CheckpointRecord, CheckpointStatus, CheckpointSummary, EntitySnapshot, PolicyDocument,
};
use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: CheckpointStore
// ═══════════════════════════════════════════════════════════════════════════

/// Durable per-entity progress ledger
///
/// Writes are keyed by `(migration_id, entity_id)`. Implementations must be
/// safe for concurrent writers on different keys; writers on the same key are
/// serialized and the last one wins.
///
/// # Core Operations
///
/// - `create`: open a pending attempt (fails loudly if it cannot be committed)
/// - `update`: record the attempt outcome
/// - `pending` / `failed`: resume and triage listings
/// - `clear`: drop a retired run
/// - `summary`: progress counts
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert a pending record, or re-open the existing one for a new attempt
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write cannot be durably committed.
    /// Callers must not proceed as if checkpointed.
    async fn create(
        &self,
        migration_id: &str,
        checkpoint_type: &str,
        entity_id: &str,
        payload: Value,
    ) -> Result<CheckpointRecord>;

    /// Set the status of the current attempt
    ///
    /// On `Failed` the retry count is incremented and `error_message` stored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::CheckpointNotFound` if no record exists.
    async fn update(
        &self,
        migration_id: &str,
        entity_id: &str,
        status: CheckpointStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Fetch the current record for an entity
    async fn get(&self, migration_id: &str, entity_id: &str) -> Result<Option<CheckpointRecord>>;

    /// List records of a run, optionally filtered by status and type
    ///
    /// Records are ordered by `created_at`.
    async fn list(
        &self,
        migration_id: &str,
        status: Option<CheckpointStatus>,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>>;

    /// Delete every record of a run, returning how many were removed
    async fn clear(&self, migration_id: &str) -> Result<usize>;

    /// Records still in `pending` (failed records are not included)
    async fn pending(
        &self,
        migration_id: &str,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>> {
        self.list(migration_id, Some(CheckpointStatus::Pending), checkpoint_type)
            .await
    }

    /// Records in `failed`, awaiting triage or explicit re-submission
    async fn failed(
        &self,
        migration_id: &str,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>> {
        self.list(migration_id, Some(CheckpointStatus::Failed), checkpoint_type)
            .await
    }

    /// Total/pending/completed/failed counts for a run
    async fn summary(&self, migration_id: &str) -> Result<CheckpointSummary> {
        let records = self.list(migration_id, None, None).await?;
        Ok(CheckpointSummary::from_records(&records))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: SnapshotStore
// ═══════════════════════════════════════════════════════════════════════════

/// One snapshot document per `(entity_type, entity_id)`
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, superseding any previous one for the same entity
    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()>;

    /// Latest snapshot for an entity, if any
    async fn get_snapshot(&self, entity_type: &str, entity_id: &str)
        -> Result<Option<EntitySnapshot>>;

    /// Remove a snapshot, returning whether one existed
    async fn delete_snapshot(&self, entity_type: &str, entity_id: &str) -> Result<bool>;

    /// Number of snapshots held for an entity type
    async fn count_snapshots(&self, entity_type: &str) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: PolicyStore
// ═══════════════════════════════════════════════════════════════════════════

/// One policy document per entity type
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// All persisted policy documents
    async fn load_policies(&self) -> Result<Vec<PolicyDocument>>;

    /// Insert or replace the document for `policy.entity_type`
    async fn save_policy(&self, policy: &PolicyDocument) -> Result<()>;
}
