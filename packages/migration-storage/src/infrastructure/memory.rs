//! In-memory store
//!
//! HashMap-backed implementation of every port. Used by tests and dry runs;
//! nothing survives the process.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::{
    CheckpointRecord, CheckpointStatus, CheckpointStore, EntitySnapshot, PolicyDocument,
    PolicyStore, SnapshotStore,
};
use crate::error::{Result, StorageError};

type EntityKey = (String, String);

#[derive(Clone, Default)]
pub struct InMemoryStore {
    checkpoints: Arc<RwLock<HashMap<EntityKey, CheckpointRecord>>>,
    snapshots: Arc<RwLock<HashMap<EntityKey, EntitySnapshot>>>,
    policies: Arc<RwLock<BTreeMap<String, PolicyDocument>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(a: &str, b: &str) -> EntityKey {
    (a.to_string(), b.to_string())
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn create(
        &self,
        migration_id: &str,
        checkpoint_type: &str,
        entity_id: &str,
        payload: Value,
    ) -> Result<CheckpointRecord> {
        let mut checkpoints = self.checkpoints.write();
        let record = checkpoints
            .entry(key(migration_id, entity_id))
            .and_modify(|existing| existing.reopen(checkpoint_type, payload.clone()))
            .or_insert_with(|| {
                CheckpointRecord::new_pending(migration_id, checkpoint_type, entity_id, payload)
            });
        Ok(record.clone())
    }

    async fn update(
        &self,
        migration_id: &str,
        entity_id: &str,
        status: CheckpointStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut checkpoints = self.checkpoints.write();
        let record = checkpoints
            .get_mut(&key(migration_id, entity_id))
            .ok_or_else(|| StorageError::checkpoint_not_found(migration_id, entity_id))?;
        record.transition(status, error_message);
        Ok(())
    }

    async fn get(&self, migration_id: &str, entity_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self
            .checkpoints
            .read()
            .get(&key(migration_id, entity_id))
            .cloned())
    }

    async fn list(
        &self,
        migration_id: &str,
        status: Option<CheckpointStatus>,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>> {
        let mut records: Vec<CheckpointRecord> = self
            .checkpoints
            .read()
            .values()
            .filter(|r| r.migration_id == migration_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .filter(|r| checkpoint_type.map_or(true, |t| r.checkpoint_type == t))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        Ok(records)
    }

    async fn clear(&self, migration_id: &str) -> Result<usize> {
        let mut checkpoints = self.checkpoints.write();
        let before = checkpoints.len();
        checkpoints.retain(|(mid, _), _| mid != migration_id);
        Ok(before - checkpoints.len())
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        self.snapshots.write().insert(
            key(&snapshot.entity_type, &snapshot.entity_id),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn get_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>> {
        Ok(self
            .snapshots
            .read()
            .get(&key(entity_type, entity_id))
            .cloned())
    }

    async fn delete_snapshot(&self, entity_type: &str, entity_id: &str) -> Result<bool> {
        Ok(self
            .snapshots
            .write()
            .remove(&key(entity_type, entity_id))
            .is_some())
    }

    async fn count_snapshots(&self, entity_type: &str) -> Result<usize> {
        Ok(self
            .snapshots
            .read()
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count())
    }
}

#[async_trait]
impl PolicyStore for InMemoryStore {
    async fn load_policies(&self) -> Result<Vec<PolicyDocument>> {
        Ok(self.policies.read().values().cloned().collect())
    }

    async fn save_policy(&self, policy: &PolicyDocument) -> Result<()> {
        self.policies
            .write()
            .insert(policy.entity_type.clone(), policy.clone());
        Ok(())
    }
}
