//! Snapshot-based change and conflict detection
//!
//! A conflict exists only where a field changed upstream *and* the same field
//! was edited in the destination since the last snapshot. Detection returns
//! `Option<ConflictRecord>`; errors are reserved for storage failures.

use super::policy::{ConflictResolution, PolicyRegistry, PreservationPolicy};
use crate::config::PreservationConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use migration_storage::{normalize, EntitySnapshot, SnapshotSource, SnapshotStore, VolatileFields};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Field name → new value
pub type FieldChanges = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// No snapshot exists
    Created,
    Unchanged,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub source_changes: FieldChanges,
    pub destination_changes: FieldChanges,
    pub conflicted_fields: BTreeSet<String>,
    pub resolution_strategy: ConflictResolution,
    pub timestamp: DateTime<Utc>,
}

/// Classify `current` against an optional snapshot
pub fn classify_with_snapshot(
    snapshot: Option<&EntitySnapshot>,
    current: &Value,
    volatile: &VolatileFields,
) -> ChangeType {
    match snapshot {
        None => ChangeType::Created,
        Some(s) if s.matches(current, volatile) => ChangeType::Unchanged,
        Some(_) => ChangeType::Modified,
    }
}

/// Top-level field diff between a snapshot and current data
///
/// Both sides are normalized first. Fields removed from `current` appear as
/// `null`. Non-object values are treated as having no fields.
pub fn diff(snapshot_data: &Value, current: &Value, volatile: &VolatileFields) -> FieldChanges {
    let before = normalize(snapshot_data, volatile);
    let after = normalize(current, volatile);
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    let mut changes = Map::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }
    changes
}

/// Pure conflict check against an already loaded snapshot
pub fn detect_with_snapshot(
    snapshot: Option<&EntitySnapshot>,
    source_changes: &FieldChanges,
    entity_id: &str,
    entity_type: &str,
    current: &Value,
    policy: &PreservationPolicy,
    volatile: &VolatileFields,
) -> Option<ConflictRecord> {
    // Without a baseline no destination edit is attributable
    let snapshot = match classify_with_snapshot(snapshot, current, volatile) {
        ChangeType::Created | ChangeType::Unchanged => return None,
        ChangeType::Modified => snapshot?,
    };

    let destination_changes = diff(&snapshot.data, current, volatile);
    let conflicted_fields: BTreeSet<String> = source_changes
        .keys()
        .filter(|key| destination_changes.contains_key(*key))
        .cloned()
        .collect();

    if conflicted_fields.is_empty() {
        return None;
    }

    debug!(
        entity_type,
        entity_id,
        fields = ?conflicted_fields,
        "Conflict detected"
    );

    Some(ConflictRecord {
        entity_id: entity_id.to_string(),
        entity_type: entity_type.to_string(),
        source_changes: source_changes.clone(),
        destination_changes,
        conflicted_fields,
        resolution_strategy: policy.conflict_resolution,
        timestamp: Utc::now(),
    })
}

pub struct ChangeDetector {
    snapshots: Arc<dyn SnapshotStore>,
    policies: Arc<PolicyRegistry>,
    volatile: VolatileFields,
}

impl ChangeDetector {
    pub fn new(snapshots: Arc<dyn SnapshotStore>, policies: Arc<PolicyRegistry>) -> Self {
        Self {
            snapshots,
            policies,
            volatile: VolatileFields::default(),
        }
    }

    pub fn from_config(
        snapshots: Arc<dyn SnapshotStore>,
        policies: Arc<PolicyRegistry>,
        config: &PreservationConfig,
    ) -> Self {
        Self::new(snapshots, policies).with_volatile_fields(config.volatile())
    }

    pub fn with_volatile_fields(mut self, volatile: VolatileFields) -> Self {
        self.volatile = volatile;
        self
    }

    pub fn volatile(&self) -> &VolatileFields {
        &self.volatile
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    /// Capture and persist a snapshot
    ///
    /// Returns `None` without writing when the entity type does not track
    /// changes.
    pub async fn store(
        &self,
        entity_id: &str,
        entity_type: &str,
        data: &Value,
        source: SnapshotSource,
    ) -> Result<Option<EntitySnapshot>> {
        if !self.policies.get(entity_type).track_changes {
            debug!(entity_type, entity_id, "Change tracking disabled, snapshot skipped");
            return Ok(None);
        }

        let snapshot = EntitySnapshot::capture(entity_id, entity_type, data, source, &self.volatile);
        self.snapshots.save_snapshot(&snapshot).await?;
        Ok(Some(snapshot))
    }

    pub async fn snapshot(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntitySnapshot>> {
        Ok(self.snapshots.get_snapshot(entity_type, entity_id).await?)
    }

    pub async fn classify(
        &self,
        entity_id: &str,
        entity_type: &str,
        current: &Value,
    ) -> Result<ChangeType> {
        let snapshot = self.snapshot(entity_type, entity_id).await?;
        Ok(classify_with_snapshot(snapshot.as_ref(), current, &self.volatile))
    }

    pub async fn detect_conflict(
        &self,
        source_changes: &FieldChanges,
        entity_id: &str,
        entity_type: &str,
        current: &Value,
    ) -> Result<Option<ConflictRecord>> {
        let snapshot = self.snapshot(entity_type, entity_id).await?;
        let policy = self.policies.get(entity_type);
        Ok(detect_with_snapshot(
            snapshot.as_ref(),
            source_changes,
            entity_id,
            entity_type,
            current,
            &policy,
            &self.volatile,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_storage::InMemoryStore;
    use serde_json::json;

    fn detector() -> ChangeDetector {
        ChangeDetector::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(PolicyRegistry::with_defaults()),
        )
    }

    fn changes(value: Value) -> FieldChanges {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_classify_lifecycle() {
        let detector = detector();
        let data = json!({"name": "A", "updated_at": "2024-01-01"});

        assert_eq!(
            detector.classify("1", "users", &data).await.unwrap(),
            ChangeType::Created
        );

        detector
            .store("1", "users", &data, SnapshotSource::Migration)
            .await
            .unwrap();

        let touched = json!({"name": "A", "updated_at": "2024-06-01"});
        assert_eq!(
            detector.classify("1", "users", &touched).await.unwrap(),
            ChangeType::Unchanged
        );
        assert_eq!(
            detector.classify("1", "users", &json!({"name": "B"})).await.unwrap(),
            ChangeType::Modified
        );
    }

    #[tokio::test]
    async fn test_conflict_intersection() {
        let detector = detector();
        detector
            .store("7", "users", &json!({"name": "A"}), SnapshotSource::Migration)
            .await
            .unwrap();

        let conflict = detector
            .detect_conflict(
                &changes(json!({"name": "C", "email": "e"})),
                "7",
                "users",
                &json!({"name": "B"}),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(conflict.conflicted_fields, BTreeSet::from(["name".to_string()]));
        assert_eq!(conflict.destination_changes["name"], json!("B"));
        assert_eq!(conflict.resolution_strategy, ConflictResolution::DestinationWins);

        let encoded = serde_json::to_value(&conflict).unwrap();
        assert!(encoded["timestamp"].is_string());
        assert_eq!(encoded["resolution_strategy"], json!("destination_wins"));
    }

    #[tokio::test]
    async fn test_identical_destination_never_conflicts() {
        let detector = detector();
        let data = json!({"name": "A", "email": "a@example.com"});
        detector
            .store("7", "users", &data, SnapshotSource::Migration)
            .await
            .unwrap();

        let result = detector
            .detect_conflict(&changes(json!({"name": "Z", "email": "z"})), "7", "users", &data)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_destination_only_edit_is_not_conflict() {
        let detector = detector();
        detector
            .store("7", "users", &json!({"name": "A", "email": "a"}), SnapshotSource::Migration)
            .await
            .unwrap();

        let result = detector
            .detect_conflict(
                &changes(json!({"name": "C"})),
                "7",
                "users",
                &json!({"name": "A", "email": "edited"}),
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_no_snapshot_is_not_conflict() {
        let result = detector()
            .detect_conflict(&changes(json!({"name": "C"})), "9", "users", &json!({"name": "B"}))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_untracked_type_skips_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(PolicyRegistry::with_defaults());
        registry.update(PreservationPolicy::fallback("attachments").with_tracking(false));
        let detector = ChangeDetector::new(store.clone(), registry);

        let stored = detector
            .store("1", "attachments", &json!({"filename": "a.png"}), SnapshotSource::Migration)
            .await
            .unwrap();

        assert!(stored.is_none());
        assert_eq!(store.count_snapshots("attachments").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_configured_volatile_fields() {
        let config = PreservationConfig {
            volatile_fields: vec!["etag".to_string()],
        };
        let detector = ChangeDetector::from_config(
            Arc::new(InMemoryStore::new()),
            Arc::new(PolicyRegistry::with_defaults()),
            &config,
        );
        detector
            .store("1", "users", &json!({"name": "A", "etag": "abc"}), SnapshotSource::Migration)
            .await
            .unwrap();

        let refetched = json!({"name": "A", "etag": "def"});
        assert_eq!(
            detector.classify("1", "users", &refetched).await.unwrap(),
            ChangeType::Unchanged
        );
    }

    #[test]
    fn test_diff_reports_removed_fields_as_null() {
        let volatile = VolatileFields::default();
        let changes = diff(
            &json!({"a": 1, "b": 2, "updated_at": "x"}),
            &json!({"a": 1, "c": 3, "updated_at": "y"}),
            &volatile,
        );

        assert_eq!(changes.len(), 2);
        assert_eq!(changes["b"], Value::Null);
        assert_eq!(changes["c"], json!(3));
    }
}
